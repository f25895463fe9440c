use std::path::Path;

use async_trait::async_trait;
use tracing::warn;

use parley_core::{ConversationScope, ThreadId};

use crate::backend::HistoryStore;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{Message, MessageRepo, NewMessage};
use crate::threads::{EnsuredThread, NewThread, Thread, ThreadRepo};

/// Embedded backend. Repo calls block on the connection mutex, so each one
/// runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    threads: ThreadRepo,
    messages: MessageRepo,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn new(db: Database) -> Self {
        Self {
            threads: ThreadRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            db,
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn ensure_thread(&self, new: NewThread) -> Result<EnsuredThread, StoreError> {
        let threads = self.threads.clone();
        self.blocking(move || threads.ensure(new)).await
    }

    async fn append_message(&self, thread_id: &ThreadId, new: NewMessage) -> Result<Message, StoreError> {
        let messages = self.messages.clone();
        let thread_id = thread_id.clone();
        self.blocking(move || messages.append(&thread_id, new)).await
    }

    async fn list_messages(&self, thread_id: &ThreadId, limit: Option<u32>) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.clone();
        let thread_id = thread_id.clone();
        self.blocking(move || messages.list(&thread_id, limit)).await
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        let threads = self.threads.clone();
        let thread_id = thread_id.clone();
        self.blocking(move || threads.get(&thread_id)).await
    }

    async fn update_group_name(&self, thread_id: &ThreadId, group_name: &str) -> Result<(), StoreError> {
        let threads = self.threads.clone();
        let thread_id = thread_id.clone();
        let group_name = group_name.to_string();
        self.blocking(move || threads.update_group_name(&thread_id, &group_name)).await
    }

    async fn list_threads(&self, robot_code: &str, scope: Option<ConversationScope>) -> Result<Vec<Thread>, StoreError> {
        let threads = self.threads.clone();
        let robot_code = robot_code.to_string();
        self.blocking(move || threads.list_for_robot(&robot_code, scope)).await
    }

    async fn health_check(&self) -> bool {
        let db = self.db.clone();
        let result = self
            .blocking(move || db.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?)))
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "sqlite health check failed");
                false
            }
        }
    }
}
