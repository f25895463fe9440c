use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use parley_core::events::Identity;
use parley_core::{ConversationScope, GenerationParams, InboundEvent, ModelProvider, Role, ThreadId, TokenCounter};
use parley_settings::Settings;
use parley_store::{HistoryStore, Message, NewThread};

use crate::context::ContextManager;
use crate::error::EngineError;
use crate::prompts::{TurnContext, DEFAULT_SYSTEM_PROMPT};
use crate::sink::{OutboundReply, ReplySink, ReplyTarget};

/// Per-deployment knobs for the turn flow.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Sent with every outbound reply.
    pub robot_code: String,
    pub params: GenerationParams,
    /// Prompt budget after the reply reserve is taken out.
    pub history_budget: u32,
    pub history_limit: Option<u32>,
    pub system_prompt: Option<String>,
    pub welcome_message: Option<String>,
    pub apology_message: String,
}

impl HandlerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            robot_code: settings.bot.robot_code.clone(),
            params: settings.model.generation_params(),
            history_budget: settings.context.history_budget(),
            history_limit: settings.context.history_limit,
            system_prompt: settings.context.system_prompt.clone(),
            welcome_message: settings.bot.welcome_message.clone(),
            apology_message: settings.bot.apology_message.clone(),
        }
    }
}

/// Result of one successfully answered turn.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub thread_id: ThreadId,
    pub assistant: Message,
    pub reply: OutboundReply,
    /// False when the sink rejected the reply. History is kept either way.
    pub delivered: bool,
}

/// Runs inbound chat events through record, build, invoke, record, reply.
///
/// Callers must not run two turns of one thread at once;
/// [`TurnDispatcher`](crate::dispatch::TurnDispatcher) queues them.
pub struct ChatHandler {
    store: Arc<dyn HistoryStore>,
    context: ContextManager,
    provider: Arc<dyn ModelProvider>,
    sink: Arc<dyn ReplySink>,
    config: HandlerConfig,
}

impl ChatHandler {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        provider: Arc<dyn ModelProvider>,
        sink: Arc<dyn ReplySink>,
        counter: Arc<dyn TokenCounter>,
        config: HandlerConfig,
    ) -> Self {
        let context = ContextManager::new(store.clone(), counter).with_history_limit(config.history_limit);
        Self {
            store,
            context,
            provider,
            sink,
            config,
        }
    }

    /// Handle one inbound event end to end.
    ///
    /// Malformed events fail with [`EngineError::Identity`] before anything
    /// is written or sent. Model failures send the configured apology and
    /// return the error; no assistant message is stored for them.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<TurnOutcome, EngineError> {
        let identity = event.identity()?;
        let text = event.clean_text()?;
        self.run_turn(&event, &identity, &text).await
    }

    #[instrument(skip_all, fields(thread_id = %identity.thread_id, scope = %identity.scope))]
    async fn run_turn(&self, event: &InboundEvent, identity: &Identity, text: &str) -> Result<TurnOutcome, EngineError> {
        let thread_id = &identity.thread_id;
        let nick = event.sender_nick();
        let title = event
            .conversation_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let target = match identity.scope {
            ConversationScope::Direct => ReplyTarget::User(identity.sender_id.clone()),
            ConversationScope::Group => ReplyTarget::Group(identity.conversation_id.clone()),
        };

        let ensured = self.store.ensure_thread(self.new_thread(identity, nick, title)).await?;
        let mut group_name = ensured.thread.group_name.clone();
        if ensured.created {
            info!(robot = %identity.robot_id, "thread created");
            if identity.scope == ConversationScope::Direct {
                if let Some(welcome) = &self.config.welcome_message {
                    self.deliver(target.clone(), welcome.clone()).await;
                }
            }
        } else if let (ConversationScope::Group, Some(title)) = (identity.scope, title) {
            if group_name.as_deref() != Some(title) {
                info!(old = ?group_name, new = title, "group renamed");
                match self.store.update_group_name(thread_id, title).await {
                    Ok(()) => group_name = Some(title.to_string()),
                    Err(e) => warn!(error = %e, "failed to refresh group name"),
                }
            }
        }

        self.context
            .record_user_turn(thread_id, text, &identity.sender_id, nick)
            .await?;

        let turn = TurnContext {
            robot_code: identity.robot_id.clone(),
            scope: identity.scope,
            sender_id: identity.sender_id.clone(),
            sender_nick: nick.to_string(),
            conversation_id: identity.conversation_id.clone(),
            group_name,
        };
        let base = self.config.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let prompt = turn.system_prompt(base, Utc::now());
        let window = self
            .context
            .build_context_with_instructions(thread_id, Some(&prompt), self.config.history_budget)
            .await?;

        let answer = match self.provider.complete(&window.messages, &self.config.params).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, kind = e.error_kind(), provider = self.provider.name(), "model call failed");
                let apology = match identity.scope {
                    ConversationScope::Group => format!("@{nick} {}", self.config.apology_message),
                    ConversationScope::Direct => self.config.apology_message.clone(),
                };
                self.deliver(target, apology).await;
                return Err(e.into());
            }
        };

        let assistant = self.context.record_turn(thread_id, Role::Assistant, &answer).await?;
        let text = match identity.scope {
            ConversationScope::Group => mention_prefixed(nick, answer),
            ConversationScope::Direct => answer,
        };
        let reply = OutboundReply {
            robot_code: self.config.robot_code.clone(),
            target,
            text,
        };
        let delivered = self.send(&reply).await;
        Ok(TurnOutcome {
            thread_id: thread_id.clone(),
            assistant,
            reply,
            delivered,
        })
    }

    fn new_thread(&self, identity: &Identity, nick: &str, title: Option<&str>) -> NewThread {
        let direct = identity.scope == ConversationScope::Direct;
        NewThread {
            thread_id: identity.thread_id.clone(),
            robot_code: identity.robot_id.clone(),
            conversation_type: identity.scope,
            conversation_id: identity.conversation_id.clone(),
            group_name: if direct { None } else { title.map(str::to_string) },
            user_id: direct.then(|| identity.sender_id.clone()),
            user_nick: direct.then(|| nick.to_string()),
        }
    }

    async fn deliver(&self, target: ReplyTarget, text: String) -> bool {
        let reply = OutboundReply {
            robot_code: self.config.robot_code.clone(),
            target,
            text,
        };
        self.send(&reply).await
    }

    async fn send(&self, reply: &OutboundReply) -> bool {
        match self.sink.deliver(reply).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "reply delivery failed");
                false
            }
        }
    }
}

/// Group replies address the sender unless the model already did.
fn mention_prefixed(nick: &str, answer: String) -> String {
    let mention = format!("@{nick}");
    if answer.starts_with(&mention) {
        answer
    } else {
        format!("{mention}\n\n{answer}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex as SyncMutex;
    use parley_core::events::Mention;
    use parley_core::{CharEstimator, GatewayError, RetryPolicy};
    use parley_llm::{MockProvider, MockResponse, ReliableConfig, ReliableProvider};
    use parley_store::SqliteStore;

    use crate::sink::TransportError;

    #[derive(Default)]
    struct RecordingSink {
        replies: SyncMutex<Vec<OutboundReply>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ReplySink for RecordingSink {
        async fn deliver(&self, reply: &OutboundReply) -> Result<(), TransportError> {
            self.replies.lock().push(reply.clone());
            if self.fail {
                Err(TransportError::Rejected {
                    status: 500,
                    body: "down".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl RecordingSink {
        fn texts(&self) -> Vec<String> {
            self.replies.lock().iter().map(|r| r.text.clone()).collect()
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            robot_code: "r1".into(),
            params: GenerationParams::default(),
            history_budget: 4000,
            history_limit: None,
            system_prompt: None,
            welcome_message: Some("welcome!".into()),
            apology_message: "sorry, try again later".into(),
        }
    }

    struct Harness {
        handler: ChatHandler,
        store: Arc<SqliteStore>,
        sink: Arc<RecordingSink>,
    }

    fn harness(provider: Arc<dyn ModelProvider>, sink: RecordingSink) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let sink = Arc::new(sink);
        let handler = ChatHandler::new(store.clone(), provider, sink.clone(), Arc::new(CharEstimator), config());
        Harness { handler, store, sink }
    }

    fn direct(text: &str) -> InboundEvent {
        InboundEvent {
            robot_id: Some("r1".into()),
            conversation_scope: Some(ConversationScope::Direct),
            sender_id: Some("u1".into()),
            conversation_id: Some("cid-dm".into()),
            text: Some(text.into()),
            sender_nick: Some("Mei".into()),
            ..Default::default()
        }
    }

    fn group(text: &str, title: &str) -> InboundEvent {
        InboundEvent {
            robot_id: Some("r1".into()),
            conversation_scope: Some(ConversationScope::Group),
            sender_id: Some("u7".into()),
            conversation_id: Some("g42".into()),
            text: Some(text.into()),
            sender_nick: Some("Kai".into()),
            conversation_title: Some(title.into()),
            at_users: vec![Mention { nick: "Parley".into() }],
        }
    }

    async fn roles(store: &SqliteStore, thread: &str) -> Vec<Role> {
        store
            .list_messages(&ThreadId::from_raw(thread), None)
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect()
    }

    #[tokio::test]
    async fn first_direct_message_gets_welcome_then_reply() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("hello Mei")]));
        let h = harness(provider.clone(), RecordingSink::default());

        let outcome = h.handler.handle_event(direct("hi")).await.unwrap();
        assert_eq!(outcome.thread_id.as_str(), "r1_u1");
        assert!(outcome.delivered);
        assert_eq!(h.sink.texts(), ["welcome!", "hello Mei"]);
        assert_eq!(h.sink.replies.lock()[1].target, ReplyTarget::User("u1".into()));
        assert_eq!(roles(&h.store, "r1_u1").await, [Role::User, Role::Assistant]);

        let sent = &provider.calls()[0];
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.contains("User nickname: Mei"));
        assert_eq!(sent.last().unwrap().content, "hi");

        let thread = h.store.get_thread(&outcome.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.user_id.as_deref(), Some("u1"));
        assert_eq!(thread.user_nick.as_deref(), Some("Mei"));
    }

    #[tokio::test]
    async fn welcome_only_on_new_thread() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("a"), MockResponse::text("b")]));
        let h = harness(provider, RecordingSink::default());
        h.handler.handle_event(direct("one")).await.unwrap();
        h.handler.handle_event(direct("two")).await.unwrap();
        assert_eq!(h.sink.texts(), ["welcome!", "a", "b"]);
    }

    #[tokio::test]
    async fn group_turn_strips_mention_and_addresses_sender() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::text("it is noon"),
            MockResponse::text("@Kai already tagged"),
        ]));
        let h = harness(provider.clone(), RecordingSink::default());

        let outcome = h.handler.handle_event(group("@Parley what time is it?", "Ops")).await.unwrap();
        assert_eq!(outcome.reply.text, "@Kai\n\nit is noon");
        assert_eq!(outcome.reply.target, ReplyTarget::Group("g42".into()));
        assert_eq!(outcome.assistant.content, "it is noon");

        let stored = h.store.list_messages(&ThreadId::from_raw("g42"), None).await.unwrap();
        assert_eq!(stored[0].content, "what time is it?");
        assert_eq!(stored[0].sender_nick.as_deref(), Some("Kai"));
        assert!(provider.calls()[0][0].content.contains("Group name: Ops"));

        let second = h.handler.handle_event(group("@Parley thanks", "Ops")).await.unwrap();
        assert_eq!(second.reply.text, "@Kai already tagged");
        // no welcome in groups
        assert_eq!(h.sink.texts().len(), 2);
    }

    #[tokio::test]
    async fn group_rename_is_persisted() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("a"), MockResponse::text("b")]));
        let h = harness(provider.clone(), RecordingSink::default());
        h.handler.handle_event(group("@Parley hi", "Ops")).await.unwrap();
        h.handler.handle_event(group("@Parley hi again", "Platform")).await.unwrap();

        let thread = h.store.get_thread(&ThreadId::from_raw("g42")).await.unwrap().unwrap();
        assert_eq!(thread.group_name.as_deref(), Some("Platform"));
        assert!(provider.calls()[1][0].content.contains("Group name: Platform"));
    }

    #[tokio::test]
    async fn model_failure_sends_apology_and_stores_no_answer() {
        let mock = MockProvider::new(vec![
            MockResponse::server_error(),
            MockResponse::server_error(),
            MockResponse::server_error(),
        ]);
        let reliable = Arc::new(ReliableProvider::new(
            mock,
            ReliableConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    jitter_factor: 0.0,
                },
                ..ReliableConfig::default()
            },
        ));
        let h = harness(reliable.clone(), RecordingSink::default());

        let err = h.handler.handle_event(direct("hi")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ModelUnavailable(GatewayError::Unavailable { attempts: 3, .. })
        ));
        assert_eq!(reliable.inner().call_count(), 3);
        assert_eq!(roles(&h.store, "r1_u1").await, [Role::User]);

        let texts = h.sink.texts();
        assert_eq!(texts.last().unwrap(), "sorry, try again later");
        assert!(texts.iter().all(|t| !t.contains("internal")));
    }

    #[tokio::test]
    async fn group_apology_mentions_sender() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Error(GatewayError::InvalidResponse(
            "empty".into(),
        ))]));
        let h = harness(provider, RecordingSink::default());
        let err = h.handler.handle_event(group("@Parley hi", "Ops")).await.unwrap_err();
        assert!(matches!(err, EngineError::Model(_)));
        assert_eq!(h.sink.texts(), ["@Kai sorry, try again later"]);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_history() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("answer")]));
        let h = harness(
            provider,
            RecordingSink {
                fail: true,
                ..Default::default()
            },
        );
        let outcome = h.handler.handle_event(direct("hi")).await.unwrap();
        assert!(!outcome.delivered);
        assert_eq!(roles(&h.store, "r1_u1").await, [Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn malformed_event_is_dropped_silently() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("never")]));
        let h = harness(provider.clone(), RecordingSink::default());
        let mut event = direct("hi");
        event.sender_id = None;

        let err = h.handler.handle_event(event).await.unwrap_err();
        assert!(matches!(err, EngineError::Identity(_)));
        assert_eq!(provider.call_count(), 0);
        assert!(h.sink.texts().is_empty());
        assert!(h.store.get_thread(&ThreadId::from_raw("r1_")).await.unwrap().is_none());
    }

    #[test]
    fn mention_prefix_is_not_doubled() {
        assert_eq!(mention_prefixed("Kai", "hi".into()), "@Kai\n\nhi");
        assert_eq!(mention_prefixed("Kai", "@Kai hi".into()), "@Kai hi");
    }
}
