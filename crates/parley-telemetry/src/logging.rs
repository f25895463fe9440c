use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warning or error persisted to the log database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub thread_id: Option<String>,
}

const DEFAULT_QUERY_LIMIT: u32 = 100;
const MAX_QUERY_LIMIT: u32 = 1000;

/// Filters for [`SqliteLogSink::query`]. Deserializes from a URL query.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub thread_id: Option<String>,
    /// Inclusive lower bound on the RFC 3339 timestamp.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 thread_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_thread ON logs(thread_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Insert errors are dropped; logging never fails the caller.
    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, thread_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.thread_id,
            ],
        );
    }

    /// Newest first. Unset filters match everything.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, level, target, message, fields, thread_id FROM logs
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR instr(target, ?2) > 0)
               AND (?3 IS NULL OR thread_id = ?3)
               AND (?4 IS NULL OR timestamp >= ?4)
             ORDER BY id DESC
             LIMIT ?5",
        )?;
        let level = q.level.as_deref().map(str::to_uppercase);
        let limit = q.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let rows = stmt.query_map(
            rusqlite::params![level, q.target, q.thread_id, q.since, limit],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    thread_id: row.get(6)?,
                })
            },
        )?;
        rows.collect()
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    thread_id: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
///
/// A `thread_id` field on the event, or on any enclosing span, is stored in
/// its own column.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    thread_id: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: serde_json::Value) {
        let _ = self.fields.insert(name.to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(val),
            "thread_id" => self.thread_id = Some(val.trim_matches('"').to_string()),
            name => self.put(name, serde_json::Value::String(val)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "thread_id" => self.thread_id = Some(value.to_string()),
            name => self.put(name, serde_json::Value::String(value.to_string())),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field.name(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.into());
    }
}

/// Stored on spans to propagate `thread_id` to child events.
struct SpanThread(String);

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.thread_id.is_none() {
            visitor.thread_id = ctx.event_scope(event).and_then(|mut scope| {
                scope.find_map(|span| {
                    let extensions = span.extensions();
                    extensions.get::<SpanThread>().map(|t| t.0.clone())
                })
            });
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).ok())
            .flatten();

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            thread_id: visitor.thread_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if let (Some(thread_id), Some(span)) = (visitor.thread_id, ctx.span(id)) {
            span.extensions_mut().insert(SpanThread(thread_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn insert(sink: &SqliteLogSink, timestamp: &str, level: &str, target: &str, message: &str, thread: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: timestamp.into(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
            fields: None,
            thread_id: thread.map(Into::into),
        });
    }

    #[test]
    fn file_backed_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        insert(&sink, "2026-10-01T12:00:00.000Z", "WARN", "parley_llm", "rate limited", None);
        assert!(path.exists());

        let reopened = SqliteLogSink::new(&path).unwrap();
        let records = reopened.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "parley_llm");
    }

    #[test]
    fn query_filters() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "2026-10-01T11:00:00.000Z", "WARN", "parley_llm::reliable", "retrying", Some("r1_u1"));
        insert(&sink, "2026-10-01T12:00:00.000Z", "ERROR", "parley_store::remote", "db down", Some("cid42"));
        insert(&sink, "2026-10-01T13:00:00.000Z", "ERROR", "parley_llm::reliable", "gave up", Some("r1_u1"));

        let errors = sink.query(&LogQuery { level: Some("error".into()), ..Default::default() }).unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "gave up");

        let store = sink.query(&LogQuery { target: Some("store".into()), ..Default::default() }).unwrap();
        assert_eq!(store.len(), 1);

        let thread = sink.query(&LogQuery { thread_id: Some("r1_u1".into()), ..Default::default() }).unwrap();
        assert_eq!(thread.len(), 2);

        let recent = sink
            .query(&LogQuery { since: Some("2026-10-01T12:00:00.000Z".into()), ..Default::default() })
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn query_limit_returns_newest() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            insert(&sink, &format!("2026-10-01T12:00:{i:02}.000Z"), "WARN", "t", &format!("msg {i}"), None);
        }
        let results = sink.query(&LogQuery { limit: Some(3), ..Default::default() }).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn layer_persists_only_warnings_and_above() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("ignored");
            tracing::debug!("ignored too");
            tracing::warn!(attempt = 2u64, "model call failed");
            tracing::error!(thread_id = "cid9", "append failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, "ERROR");
        assert_eq!(records[0].thread_id.as_deref(), Some("cid9"));
        assert_eq!(records[1].message, "model call failed");
        assert_eq!(records[1].fields.as_deref(), Some(r#"{"attempt":2}"#));
    }

    #[test]
    fn layer_takes_thread_id_from_enclosing_span() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("handle_event", thread_id = "r1_u7");
            let _entered = span.enter();
            tracing::warn!("delivery failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].thread_id.as_deref(), Some("r1_u7"));
    }
}
