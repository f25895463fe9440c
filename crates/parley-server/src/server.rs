use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use parley_core::{ConversationScope, InboundEvent};
use parley_engine::{ChatHandler, TurnDispatcher};
use parley_store::HistoryStore;
use parley_telemetry::{LogQuery, SqliteLogSink};

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            request_timeout_secs: 30,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Per-thread turn queues, drained on shutdown.
    pub turns: Arc<TurnDispatcher>,
    pub store: Arc<dyn HistoryStore>,
    /// Persisted warnings, served on `/logs` when present.
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl AppState {
    pub fn new(handler: Arc<ChatHandler>, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            turns: Arc::new(TurnDispatcher::new(handler)),
            store,
            logs: None,
        }
    }

    pub fn with_logs(mut self, logs: Option<Arc<SqliteLogSink>>) -> Self {
        self.logs = logs;
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/events", post(events_handler))
        .route("/health", get(health_handler))
        .route("/robots/{robot_code}/threads", get(threads_handler))
        .route("/logs", get(logs_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving. The server stops accepting when `shutdown` is
/// cancelled; [`ServerHandle::join`] then waits for in-flight turns.
pub async fn start(config: ServerConfig, state: AppState, shutdown: CancellationToken) -> Result<ServerHandle, std::io::Error> {
    let turns = state.turns.clone();
    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "parley server started");

    let server = tokio::spawn(async move {
        let stop = async move { shutdown.cancelled().await };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stop).await {
            error!(error = %e, "server terminated");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
        turns,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
    turns: Arc<TurnDispatcher>,
}

impl ServerHandle {
    /// Wait for the listener to stop, then drain background turns.
    pub async fn join(self) {
        if let Err(e) = self.server.await {
            error!(error = %e, "server task panicked");
        }
        self.turns.drain().await;
        info!("parley server stopped");
    }
}

/// Inbound webhook. Queues the turn in arrival order and acks at once.
/// Malformed events are acked too, so the platform does not redeliver them.
async fn events_handler(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let event: InboundEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "dropping unparseable event");
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.turns.dispatch(event) {
        Ok(thread_id) => debug!(thread_id = %thread_id, "turn queued"),
        Err(e) => warn!(error = %e, "dropping malformed event"),
    }
    StatusCode::ACCEPTED
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.health_check().await {
        (StatusCode::OK, Json(json!({ "status": "healthy" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unhealthy" })))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThreadsQuery {
    scope: Option<ConversationScope>,
}

/// Threads a robot takes part in. `?scope=group` lists its groups.
async fn threads_handler(
    State(state): State<AppState>,
    Path(robot_code): Path<String>,
    Query(query): Query<ThreadsQuery>,
) -> Response {
    match state.store.list_threads(&robot_code, query.scope).await {
        Ok(threads) => Json(threads).into_response(),
        Err(e) => {
            error!(robot = %robot_code, error = %e, "listing threads failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "store unavailable" }))).into_response()
        }
    }
}

/// Persisted warnings and errors, newest first.
async fn logs_handler(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    let Some(sink) = state.logs.clone() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "log persistence is disabled" }))).into_response();
    };
    match tokio::task::spawn_blocking(move || sink.query(&query)).await {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "log query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "log query failed" }))).into_response()
        }
        Err(e) => {
            error!(error = %e, "log query task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{CharEstimator, ConversationScope, GenerationParams, ThreadId};
    use parley_engine::{HandlerConfig, OutboundReply, ReplySink, TransportError};
    use parley_llm::{MockProvider, MockResponse};
    use parley_store::SqliteStore;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<OutboundReply>);

    #[async_trait::async_trait]
    impl ReplySink for ChannelSink {
        async fn deliver(&self, reply: &OutboundReply) -> Result<(), TransportError> {
            let _ = self.0.send(reply.clone());
            Ok(())
        }
    }

    struct Running {
        handle: ServerHandle,
        shutdown: CancellationToken,
        replies: mpsc::UnboundedReceiver<OutboundReply>,
        store: Arc<SqliteStore>,
    }

    async fn running(responses: Vec<MockResponse>) -> Running {
        running_with_logs(responses, None).await
    }

    async fn running_with_logs(responses: Vec<MockResponse>, logs: Option<Arc<SqliteLogSink>>) -> Running {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (tx, replies) = mpsc::unbounded_channel();
        let handler = ChatHandler::new(
            store.clone(),
            Arc::new(MockProvider::new(responses)),
            Arc::new(ChannelSink(tx)),
            Arc::new(CharEstimator),
            HandlerConfig {
                robot_code: "r1".into(),
                params: GenerationParams::default(),
                history_budget: 4000,
                history_limit: None,
                system_prompt: None,
                welcome_message: None,
                apology_message: "sorry".into(),
            },
        );
        let shutdown = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let state = AppState::new(Arc::new(handler), store.clone()).with_logs(logs);
        let handle = start(config, state, shutdown.clone()).await.unwrap();
        Running {
            handle,
            shutdown,
            replies,
            store,
        }
    }

    fn url(r: &Running, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", r.handle.port)
    }

    #[tokio::test]
    async fn health_reports_store_state() {
        let r = running(vec![]).await;
        let resp = reqwest::get(url(&r, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn event_is_acked_then_answered() {
        let mut r = running(vec![MockResponse::text("pong")]).await;
        let event = json!({
            "robot_id": "r1",
            "conversation_scope": ConversationScope::Direct,
            "sender_id": "u1",
            "conversation_id": "cid1",
            "text": "ping"
        });
        let resp = reqwest::Client::new()
            .post(url(&r, "/events"))
            .json(&event)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);

        let reply = tokio::time::timeout(Duration::from_secs(5), r.replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.text, "pong");

        let history = r.store.list_messages(&ThreadId::from_raw("r1_u1"), None).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rapid_events_are_stored_in_arrival_order() {
        let responses = (0..10)
            .map(|i| MockResponse::delayed(Duration::from_millis(2), MockResponse::text(format!("a{i}"))))
            .collect();
        let r = running(responses).await;
        let client = reqwest::Client::new();
        for i in 0..10 {
            let event = json!({
                "robot_id": "r1",
                "conversation_scope": ConversationScope::Direct,
                "sender_id": "u1",
                "conversation_id": "cid1",
                "text": format!("m{i}")
            });
            let resp = client.post(url(&r, "/events")).json(&event).send().await.unwrap();
            assert_eq!(resp.status(), 202);
        }

        r.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), r.handle.join())
            .await
            .unwrap();

        let users: Vec<String> = r
            .store
            .list_messages(&ThreadId::from_raw("r1_u1"), None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.role == parley_core::Role::User)
            .map(|m| m.content)
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(users, expected);
    }

    #[tokio::test]
    async fn malformed_event_is_acked_and_dropped() {
        let r = running(vec![]).await;
        let resp = reqwest::Client::new()
            .post(url(&r, "/events"))
            .json(&json!({ "robot_id": "r1", "text": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(r.handle.turns.active_threads(), 0);
    }

    #[tokio::test]
    async fn robot_groups_are_listed() {
        let r = running(vec![MockResponse::text("a"), MockResponse::text("b")]).await;
        let client = reqwest::Client::new();
        for (conversation, title) in [("g1", "Ops"), ("g2", "Infra")] {
            let event = json!({
                "robot_id": "r1",
                "conversation_scope": ConversationScope::Group,
                "sender_id": "u1",
                "conversation_id": conversation,
                "conversation_title": title,
                "text": "hello"
            });
            client.post(url(&r, "/events")).json(&event).send().await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while r.store.list_threads("r1", None).await.unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let groups: Vec<serde_json::Value> = reqwest::get(url(&r, "/robots/r1/threads?scope=group"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let mut names: Vec<_> = groups.iter().map(|g| g["group_name"].as_str().unwrap().to_string()).collect();
        names.sort();
        assert_eq!(names, ["Infra", "Ops"]);

        let none: Vec<serde_json::Value> = reqwest::get(url(&r, "/robots/r1/threads?scope=direct"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn logs_are_served_when_persisted() {
        use tracing_subscriber::layer::SubscriberExt;

        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(parley_telemetry::SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(thread_id = "r1_u1", "reply delivery failed");
            tracing::error!(thread_id = "g42", "turn failed");
        });

        let r = running_with_logs(vec![], Some(sink)).await;
        let resp = reqwest::get(url(&r, "/logs?thread_id=r1_u1&limit=10")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let records: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], "reply delivery failed");
        assert_eq!(records[0]["level"], "WARN");

        let errors: Vec<serde_json::Value> = reqwest::get(url(&r, "/logs?level=error"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["thread_id"], "g42");
    }

    #[tokio::test]
    async fn logs_route_without_sink_is_not_found() {
        let r = running(vec![]).await;
        let resp = reqwest::get(url(&r, "/logs")).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn garbage_body_is_rejected() {
        let r = running(vec![]).await;
        let resp = reqwest::Client::new()
            .post(url(&r, "/events"))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn shutdown_drains_and_stops() {
        let r = running(vec![]).await;
        let port = r.handle.port;
        r.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), r.handle.join())
            .await
            .unwrap();
        assert!(reqwest::get(format!("http://127.0.0.1:{port}/health")).await.is_err());
    }
}
