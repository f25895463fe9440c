pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod retry;
pub mod tokens;

pub use errors::GatewayError;
pub use events::{IdentityError, InboundEvent};
pub use identity::{resolve, ConversationScope};
pub use ids::{MessageId, ThreadId};
pub use messages::{ChatMessage, Role};
pub use provider::{GenerationParams, ModelProvider};
pub use retry::RetryPolicy;
pub use tokens::{CharEstimator, TokenCounter};
