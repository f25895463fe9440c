pub mod server;
pub mod webhook;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use webhook::{WebhookConfig, WebhookReplySink};
