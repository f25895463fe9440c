pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod prompts;
pub mod sink;

pub use context::{ContextManager, ContextOverflowWarning, ContextWindow};
pub use dispatch::TurnDispatcher;
pub use error::EngineError;
pub use handler::{ChatHandler, HandlerConfig, TurnOutcome};
pub use prompts::{TurnContext, DEFAULT_SYSTEM_PROMPT};
pub use sink::{LogReplySink, OutboundReply, ReplySink, ReplyTarget, TransportError};
