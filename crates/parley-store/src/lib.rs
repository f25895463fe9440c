pub mod backend;
pub mod database;
pub mod error;
pub mod messages;
pub mod remote;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;
pub mod threads;

pub use backend::{HistoryStore, StoreBackend};
pub use database::Database;
pub use error::StoreError;
pub use messages::{Message, NewMessage};
pub use remote::RemoteStore;
pub use sqlite::SqliteStore;
pub use threads::{EnsuredThread, NewThread, Thread};
