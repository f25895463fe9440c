use std::sync::Arc;

use tracing::{debug, instrument, warn};

use parley_core::{ChatMessage, Role, ThreadId, TokenCounter};
use parley_store::{HistoryStore, Message, NewMessage};

use crate::error::EngineError;

/// The newest message alone did not fit the budget; it was sent anyway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextOverflowWarning {
    pub total_tokens: u32,
    pub max_tokens: u32,
}

/// History selected for one model call, oldest first after the pinned
/// system messages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextWindow {
    pub messages: Vec<ChatMessage>,
    pub total_tokens: u32,
    pub overflow: Option<ContextOverflowWarning>,
}

/// Loads thread history through the store and bounds it to a token budget.
pub struct ContextManager {
    store: Arc<dyn HistoryStore>,
    counter: Arc<dyn TokenCounter>,
    history_limit: Option<u32>,
}

impl ContextManager {
    pub fn new(store: Arc<dyn HistoryStore>, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            store,
            counter,
            history_limit: None,
        }
    }

    /// Only the most recent `limit` messages are loaded before trimming.
    pub fn with_history_limit(mut self, limit: Option<u32>) -> Self {
        self.history_limit = limit;
        self
    }

    pub async fn build_context(&self, thread_id: &ThreadId, max_tokens: u32) -> Result<ContextWindow, EngineError> {
        self.build_context_with_instructions(thread_id, None, max_tokens).await
    }

    /// Like [`build_context`](Self::build_context), with a per-turn
    /// instruction prompt pinned ahead of everything else.
    #[instrument(skip(self, instructions), fields(thread_id = %thread_id))]
    pub async fn build_context_with_instructions(
        &self,
        thread_id: &ThreadId,
        instructions: Option<&str>,
        max_tokens: u32,
    ) -> Result<ContextWindow, EngineError> {
        let history = self.store.list_messages(thread_id, self.history_limit).await?;
        let pinned = instructions.map(|text| {
            let message = ChatMessage::system(text);
            let tokens = self.counter.count_message(&message);
            (message, tokens)
        });

        let window = select_window(pinned, &history, max_tokens);
        debug!(
            loaded = history.len(),
            sent = window.messages.len(),
            tokens = window.total_tokens,
            max_tokens,
            "context built"
        );
        if let Some(overflow) = window.overflow {
            warn!(
                total_tokens = overflow.total_tokens,
                max_tokens = overflow.max_tokens,
                "context exceeds budget, sending best-effort window"
            );
        }
        Ok(window)
    }

    /// Persist a turn, counting its tokens once.
    pub async fn record_turn(&self, thread_id: &ThreadId, role: Role, content: &str) -> Result<Message, EngineError> {
        let tokens = self.counter.count_message(&ChatMessage::new(role, content));
        self.record(thread_id, NewMessage::new(role, content, tokens)).await
    }

    /// Persist a user turn along with who sent it.
    pub async fn record_user_turn(
        &self,
        thread_id: &ThreadId,
        content: &str,
        sender_id: &str,
        sender_nick: &str,
    ) -> Result<Message, EngineError> {
        let tokens = self.counter.count_message(&ChatMessage::user(content));
        let new = NewMessage::new(Role::User, content, tokens).with_sender(sender_id, sender_nick);
        self.record(thread_id, new).await
    }

    #[instrument(skip(self, new), fields(thread_id = %thread_id, role = %new.role, tokens = new.token_count))]
    async fn record(&self, thread_id: &ThreadId, new: NewMessage) -> Result<Message, EngineError> {
        Ok(self.store.append_message(thread_id, new).await?)
    }
}

/// Pick the messages to send.
///
/// The instruction prompt and stored system messages are always kept. The
/// rest is taken newest first while it fits in what is left of the budget,
/// stopping at the first message that does not. The newest message is kept
/// even when it alone is over budget, and the window is flagged.
pub fn select_window(pinned: Option<(ChatMessage, u32)>, history: &[Message], max_tokens: u32) -> ContextWindow {
    let mut messages = Vec::new();
    let mut pinned_tokens = 0u32;
    if let Some((message, tokens)) = pinned {
        messages.push(message);
        pinned_tokens = pinned_tokens.saturating_add(tokens);
    }
    for stored in history.iter().filter(|m| m.role == Role::System) {
        messages.push(stored.to_chat());
        pinned_tokens = pinned_tokens.saturating_add(stored.token_count);
    }

    let remaining = max_tokens.saturating_sub(pinned_tokens);
    let mut used = 0u32;
    let mut suffix: Vec<&Message> = Vec::new();
    for message in history.iter().rev().filter(|m| m.role != Role::System) {
        let next = used.saturating_add(message.token_count);
        if next > remaining && !suffix.is_empty() {
            break;
        }
        suffix.push(message);
        used = next;
        if used > remaining {
            break;
        }
    }

    messages.extend(suffix.iter().rev().map(|m| m.to_chat()));
    let total_tokens = pinned_tokens.saturating_add(used);
    let overflow = (total_tokens > max_tokens).then_some(ContextOverflowWarning {
        total_tokens,
        max_tokens,
    });
    ContextWindow {
        messages,
        total_tokens,
        overflow,
    }
}
