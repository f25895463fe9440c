use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use parley_core::{ConversationScope, ThreadId};
use parley_settings::{DatabaseSettings, DatabaseType};

use crate::error::StoreError;
use crate::messages::{Message, NewMessage};
use crate::remote::RemoteStore;
use crate::sqlite::SqliteStore;
use crate::threads::{EnsuredThread, NewThread, Thread};

/// Durable storage of threads and their messages.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create-or-fetch. Concurrent calls for one id never create duplicates.
    async fn ensure_thread(&self, new: NewThread) -> Result<EnsuredThread, StoreError>;

    /// Append with the next sequence number and bump `last_active_at`.
    async fn append_message(&self, thread_id: &ThreadId, new: NewMessage) -> Result<Message, StoreError>;

    /// Oldest first. With `limit = N`, the most recent N messages.
    async fn list_messages(&self, thread_id: &ThreadId, limit: Option<u32>) -> Result<Vec<Message>, StoreError>;

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError>;

    async fn update_group_name(&self, thread_id: &ThreadId, group_name: &str) -> Result<(), StoreError>;

    /// Threads a robot takes part in, most recently active first.
    /// `scope = Some(Group)` lists the groups the robot has been added to.
    async fn list_threads(&self, robot_code: &str, scope: Option<ConversationScope>) -> Result<Vec<Thread>, StoreError>;

    async fn health_check(&self) -> bool;
}

/// The configured backend, chosen once at startup.
pub enum StoreBackend {
    Sqlite(SqliteStore),
    Remote(RemoteStore),
}

impl StoreBackend {
    pub fn from_settings(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        match settings.database_type {
            DatabaseType::Sqlite => {
                info!(path = %settings.sqlite_path, "using sqlite store");
                Ok(Self::Sqlite(SqliteStore::open(Path::new(&settings.sqlite_path))?))
            }
            DatabaseType::Remote => {
                let store = RemoteStore::from_settings(settings)?;
                info!(url = %store.base_url(), "using remote store");
                Ok(Self::Remote(store))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Remote(_) => "remote",
        }
    }

    fn inner(&self) -> &dyn HistoryStore {
        match self {
            Self::Sqlite(store) => store,
            Self::Remote(store) => store,
        }
    }
}

#[async_trait]
impl HistoryStore for StoreBackend {
    async fn ensure_thread(&self, new: NewThread) -> Result<EnsuredThread, StoreError> {
        self.inner().ensure_thread(new).await
    }

    async fn append_message(&self, thread_id: &ThreadId, new: NewMessage) -> Result<Message, StoreError> {
        self.inner().append_message(thread_id, new).await
    }

    async fn list_messages(&self, thread_id: &ThreadId, limit: Option<u32>) -> Result<Vec<Message>, StoreError> {
        self.inner().list_messages(thread_id, limit).await
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        self.inner().get_thread(thread_id).await
    }

    async fn update_group_name(&self, thread_id: &ThreadId, group_name: &str) -> Result<(), StoreError> {
        self.inner().update_group_name(thread_id, group_name).await
    }

    async fn list_threads(&self, robot_code: &str, scope: Option<ConversationScope>) -> Result<Vec<Thread>, StoreError> {
        self.inner().list_threads(robot_code, scope).await
    }

    async fn health_check(&self) -> bool {
        self.inner().health_check().await
    }
}
