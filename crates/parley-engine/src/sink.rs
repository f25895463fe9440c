use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// Where a reply goes: a user for direct threads, a conversation for groups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "target_type", content = "target_id", rename_all = "snake_case")]
pub enum ReplyTarget {
    User(String),
    Group(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundReply {
    pub robot_code: String,
    #[serde(flatten)]
    pub target: ReplyTarget,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("transport rejected reply with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound half of the chat transport.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), TransportError>;
}

/// Writes replies to the log instead of sending them.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReplySink;

#[async_trait]
impl ReplySink for LogReplySink {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        info!(target_kind = ?reply.target, chars = reply.text.chars().count(), text = %reply.text, "reply (log only)");
        Ok(())
    }
}
