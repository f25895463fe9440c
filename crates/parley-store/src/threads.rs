use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use parley_core::{ConversationScope, ThreadId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_timestamp};

const TABLE: &str = "threads";

/// A stored conversation thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: ThreadId,
    pub robot_code: String,
    pub conversation_type: ConversationScope,
    pub conversation_id: String,
    pub created_at: String,
    pub last_active_at: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_nick: Option<String>,
}

/// Everything needed to create a thread on first contact.
#[derive(Clone, Debug, PartialEq)]
pub struct NewThread {
    pub thread_id: ThreadId,
    pub robot_code: String,
    pub conversation_type: ConversationScope,
    pub conversation_id: String,
    pub group_name: Option<String>,
    pub user_id: Option<String>,
    pub user_nick: Option<String>,
}

impl NewThread {
    /// Stamp creation and activity times.
    pub fn into_thread(self, now: String) -> Thread {
        Thread {
            thread_id: self.thread_id,
            robot_code: self.robot_code,
            conversation_type: self.conversation_type,
            conversation_id: self.conversation_id,
            created_at: now.clone(),
            last_active_at: now,
            group_name: self.group_name,
            user_id: self.user_id,
            user_nick: self.user_nick,
        }
    }
}

/// Result of `ensure_thread`: the stored row and whether this call created it.
#[derive(Clone, Debug, PartialEq)]
pub struct EnsuredThread {
    pub thread: Thread,
    pub created: bool,
}

const SELECT_COLUMNS: &str = "thread_id, robot_code, conversation_type, conversation_id, created_at, \
                              last_active_at, group_name, user_id, user_nick";

/// Synchronous thread queries against the shared connection.
#[derive(Clone)]
pub struct ThreadRepo {
    db: Database,
}

impl ThreadRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the thread if absent, then return the stored row.
    #[instrument(skip(self, new), fields(thread_id = %new.thread_id))]
    pub fn ensure(&self, new: NewThread) -> Result<EnsuredThread, StoreError> {
        let candidate = new.into_thread(now_timestamp());
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO threads (thread_id, robot_code, conversation_type, conversation_id,
                                      created_at, last_active_at, group_name, user_id, user_nick)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(thread_id) DO NOTHING",
                rusqlite::params![
                    candidate.thread_id.as_str(),
                    candidate.robot_code,
                    candidate.conversation_type.as_str(),
                    candidate.conversation_id,
                    candidate.created_at,
                    candidate.last_active_at,
                    candidate.group_name,
                    candidate.user_id,
                    candidate.user_nick,
                ],
            )?;

            if inserted == 1 {
                debug!("thread created");
                return Ok(EnsuredThread {
                    thread: candidate,
                    created: true,
                });
            }

            let thread = query_thread(conn, &candidate.thread_id)?
                .ok_or_else(|| StoreError::NotFound(format!("thread {}", candidate.thread_id)))?;
            Ok(EnsuredThread { thread, created: false })
        })
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn get(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        self.db.with_conn(|conn| query_thread(conn, thread_id))
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn update_group_name(&self, thread_id: &ThreadId, group_name: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE threads SET group_name = ?1 WHERE thread_id = ?2",
                rusqlite::params![group_name, thread_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("thread {thread_id}")));
            }
            Ok(())
        })
    }

    /// A robot's threads, most recently active first, optionally of one scope.
    #[instrument(skip(self))]
    pub fn list_for_robot(&self, robot_code: &str, scope: Option<ConversationScope>) -> Result<Vec<Thread>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM threads
                 WHERE robot_code = ?1 AND (?2 IS NULL OR conversation_type = ?2)
                 ORDER BY last_active_at DESC, thread_id"
            ))?;
            let mut rows = stmt.query(rusqlite::params![robot_code, scope.map(|s| s.as_str())])?;
            let mut threads = Vec::new();
            while let Some(row) = rows.next()? {
                threads.push(row_to_thread(row)?);
            }
            Ok(threads)
        })
    }
}

fn query_thread(conn: &rusqlite::Connection, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM threads WHERE thread_id = ?1"))?;
    let mut rows = stmt.query([thread_id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_thread(row)?)),
        None => Ok(None),
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> Result<Thread, StoreError> {
    let scope: String = row_helpers::get(row, 2, TABLE, "conversation_type")?;
    Ok(Thread {
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 0, TABLE, "thread_id")?),
        robot_code: row_helpers::get(row, 1, TABLE, "robot_code")?,
        conversation_type: row_helpers::parse_enum(&scope, TABLE, "conversation_type")?,
        conversation_id: row_helpers::get(row, 3, TABLE, "conversation_id")?,
        created_at: row_helpers::get(row, 4, TABLE, "created_at")?,
        last_active_at: row_helpers::get(row, 5, TABLE, "last_active_at")?,
        group_name: row_helpers::get_opt(row, 6, TABLE, "group_name")?,
        user_id: row_helpers::get_opt(row, 7, TABLE, "user_id")?,
        user_nick: row_helpers::get_opt(row, 8, TABLE, "user_nick")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(thread: &str) -> NewThread {
        NewThread {
            thread_id: ThreadId::from_raw(thread),
            robot_code: "r1".into(),
            conversation_type: ConversationScope::Direct,
            conversation_id: "cid_direct".into(),
            group_name: None,
            user_id: Some("u1".into()),
            user_nick: Some("Alice".into()),
        }
    }

    fn repo() -> ThreadRepo {
        ThreadRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn ensure_creates_then_fetches() {
        let repo = repo();
        let first = repo.ensure(direct("r1_u1")).unwrap();
        assert!(first.created);
        assert_eq!(first.thread.conversation_type, ConversationScope::Direct);
        assert_eq!(first.thread.created_at, first.thread.last_active_at);

        let mut again = direct("r1_u1");
        again.user_nick = Some("Renamed".into());
        let second = repo.ensure(again).unwrap();
        assert!(!second.created);
        assert_eq!(second.thread, first.thread);
    }

    #[test]
    fn get_missing_thread_is_none() {
        assert!(repo().get(&ThreadId::from_raw("nope")).unwrap().is_none());
    }

    #[test]
    fn update_group_name() {
        let repo = repo();
        let mut group = direct("cid42");
        group.conversation_type = ConversationScope::Group;
        group.group_name = Some("Old".into());
        repo.ensure(group).unwrap();

        let id = ThreadId::from_raw("cid42");
        repo.update_group_name(&id, "New name").unwrap();
        assert_eq!(repo.get(&id).unwrap().unwrap().group_name.as_deref(), Some("New name"));

        let missing = repo.update_group_name(&ThreadId::from_raw("cid0"), "x");
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_for_robot_filters_and_orders_by_activity() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db.clone());
        let mut ops = direct("g_ops");
        ops.conversation_type = ConversationScope::Group;
        ops.group_name = Some("Ops".into());
        let mut infra = direct("g_infra");
        infra.conversation_type = ConversationScope::Group;
        infra.group_name = Some("Infra".into());
        let mut other_robot = direct("g_other");
        other_robot.robot_code = "r2".into();
        other_robot.conversation_type = ConversationScope::Group;
        for new in [ops, infra, direct("r1_u1"), other_robot] {
            repo.ensure(new).unwrap();
        }
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET last_active_at = '2099-01-01T00:00:00.000Z' WHERE thread_id = 'g_ops'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let groups = repo.list_for_robot("r1", Some(ConversationScope::Group)).unwrap();
        let names: Vec<_> = groups.iter().map(|t| t.group_name.as_deref().unwrap()).collect();
        assert_eq!(names, ["Ops", "Infra"]);

        let all = repo.list_for_robot("r1", None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|t| t.robot_code == "r1"));
        assert!(repo.list_for_robot("r9", None).unwrap().is_empty());
    }

    #[test]
    fn unknown_scope_is_corrupt_row() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (thread_id, robot_code, conversation_type, conversation_id, created_at, last_active_at)
                 VALUES ('t1', 'r1', 'channel', 'c1', 'x', 'x')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let err = ThreadRepo::new(db).get(&ThreadId::from_raw("t1")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "conversation_type", .. }));
    }

    #[test]
    fn thread_json_uses_column_names() {
        let thread = direct("r1_u1").into_thread("2026-10-01T00:00:00.000Z".into());
        let json = serde_json::to_value(&thread).unwrap();
        assert_eq!(json["thread_id"], "r1_u1");
        assert_eq!(json["conversation_type"], "direct");
        assert_eq!(json["user_nick"], "Alice");
    }
}
