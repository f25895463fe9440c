use serde::{Deserialize, Serialize};

use crate::identity::{self, ConversationScope};
use crate::ids::ThreadId;

/// A chat event as delivered by the inbound transport.
///
/// Identity fields are optional on the wire so that malformed events can be
/// reported as [`IdentityError`] instead of failing deserialization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub conversation_scope: Option<ConversationScope>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sender_nick: Option<String>,
    #[serde(default)]
    pub conversation_title: Option<String>,
    #[serde(default)]
    pub at_users: Vec<Mention>,
}

/// A user mentioned in a group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mention {
    pub nick: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("inbound event is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Validated identity of an inbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub robot_id: String,
    pub scope: ConversationScope,
    pub sender_id: String,
    pub conversation_id: String,
    pub thread_id: ThreadId,
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, IdentityError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::MissingField(field))
}

impl InboundEvent {
    /// Validate the identity fields and resolve the thread id.
    pub fn identity(&self) -> Result<Identity, IdentityError> {
        let robot_id = required(&self.robot_id, "robot_id")?;
        let scope = self
            .conversation_scope
            .ok_or(IdentityError::MissingField("conversation_scope"))?;
        let sender_id = required(&self.sender_id, "sender_id")?;
        let conversation_id = required(&self.conversation_id, "conversation_id")?;

        let thread_id = match scope {
            ConversationScope::Direct => identity::resolve(robot_id, scope, sender_id),
            ConversationScope::Group => identity::resolve(robot_id, scope, conversation_id),
        };

        Ok(Identity {
            robot_id: robot_id.to_string(),
            scope,
            sender_id: sender_id.to_string(),
            conversation_id: conversation_id.to_string(),
            thread_id,
        })
    }

    /// Message text with surrounding whitespace removed and, in groups,
    /// `@nick` mentions stripped out.
    pub fn clean_text(&self) -> Result<String, IdentityError> {
        let raw = required(&self.text, "text")?;
        if self.conversation_scope != Some(ConversationScope::Group) {
            return Ok(raw.to_string());
        }

        let mut text = raw.to_string();
        for mention in self.at_users.iter().filter(|m| !m.nick.is_empty()) {
            text = text.replace(&format!("@{}", mention.nick), "");
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(IdentityError::MissingField("text"));
        }
        Ok(text)
    }

    pub fn sender_nick(&self) -> &str {
        self.sender_nick
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or("user")
    }
}
