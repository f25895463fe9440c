//! Hosted backend speaking the PostgREST dialect (Supabase-style REST).
//!
//! Rows travel as JSON objects whose keys are the column names, so
//! [`Thread`] and [`Message`] deserialize straight from responses.
//! Idempotent calls go through the read [`RetryPolicy`]. A message insert
//! is retried only when the server reports a sequence conflict, which
//! means nothing was written.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use parley_core::{ConversationScope, MessageId, RetryPolicy, ThreadId};
use parley_settings::DatabaseSettings;

use crate::backend::HistoryStore;
use crate::error::StoreError;
use crate::messages::{Message, NewMessage};
use crate::row_helpers::now_timestamp;
use crate::threads::{EnsuredThread, NewThread, Thread};

/// Attempts at finding a free sequence number before giving up.
const SEQUENCE_ATTEMPTS: u32 = 5;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgREST error body.
#[derive(Debug, Default, Deserialize)]
struct PgError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct SequenceRow {
    sequence: i64,
}

pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    key: Option<SecretString>,
    threads_table: String,
    messages_table: String,
    read_policy: RetryPolicy,
}

impl RemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        key: Option<SecretString>,
        timeout: Duration,
        read_policy: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key,
            threads_table: "threads".into(),
            messages_table: "messages".into(),
            read_policy,
        })
    }

    pub fn from_settings(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let url = settings
            .remote_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| StoreError::Unreachable("remote store URL is not configured".into()))?;
        let mut store = Self::new(
            url,
            settings.remote_key.clone().map(SecretString::from),
            Duration::from_secs(settings.remote_timeout_secs),
            settings.read_retry_policy(),
        )?;
        store.threads_table.clone_from(&settings.threads_table);
        store.messages_table.clone_from(&settings.messages_table);
        Ok(store)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_headers(&self) -> Result<HeaderMap, StoreError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.key {
            let secret = key.expose_secret();
            let apikey = HeaderValue::from_str(secret)
                .map_err(|e| StoreError::Unreachable(format!("invalid api key header: {e}")))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {secret}"))
                .map_err(|e| StoreError::Unreachable(format!("invalid authorization header: {e}")))?;
            let _ = headers.insert("apikey", apikey);
            let _ = headers.insert(AUTHORIZATION, bearer);
        }
        Ok(headers)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> Result<RequestBuilder, StoreError> {
        Ok(self
            .client
            .request(method, self.table_url(table))
            .headers(self.auth_headers()?))
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Remote {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, StoreError> {
        Ok(Self::send(builder).await?.json().await?)
    }

    /// Run an idempotent request under the read policy.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        self.read_policy
            .run(StoreError::is_transient, |_| op())
            .await
            .map_err(|e| e.error)
    }

    async fn fetch_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        let rows: Vec<Thread> = self
            .with_retry(move || async move {
                let builder = self
                    .request(reqwest::Method::GET, &self.threads_table)?
                    .query(&[("thread_id", format!("eq.{thread_id}")), ("limit", "1".into())]);
                Self::send_json(builder).await
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn next_sequence(&self, thread_id: &ThreadId) -> Result<i64, StoreError> {
        let rows: Vec<SequenceRow> = self
            .with_retry(move || async move {
                let builder = self.request(reqwest::Method::GET, &self.messages_table)?.query(&[
                    ("select", "sequence".to_string()),
                    ("thread_id", format!("eq.{thread_id}")),
                    ("order", "sequence.desc".into()),
                    ("limit", "1".into()),
                ]);
                Self::send_json(builder).await
            })
            .await?;
        Ok(rows.first().map_or(0, |r| r.sequence + 1))
    }

    async fn patch_thread(&self, thread_id: &ThreadId, body: serde_json::Value) -> Result<Vec<Thread>, StoreError> {
        let body = &body;
        self.with_retry(move || async move {
            let builder = self
                .request(reqwest::Method::PATCH, &self.threads_table)?
                .query(&[("thread_id", format!("eq.{thread_id}"))])
                .header("Prefer", "return=representation")
                .json(body);
            Self::send_json(builder).await
        })
        .await
    }
}

fn pg_error(body: &str) -> PgError {
    serde_json::from_str(body).unwrap_or_default()
}

#[async_trait]
impl HistoryStore for RemoteStore {
    #[instrument(skip(self, new), fields(thread_id = %new.thread_id))]
    async fn ensure_thread(&self, new: NewThread) -> Result<EnsuredThread, StoreError> {
        let thread = new.into_thread(now_timestamp());
        let candidate = &thread;

        let inserted: Vec<Thread> = self
            .with_retry(move || async move {
                let builder = self
                    .request(reqwest::Method::POST, &self.threads_table)?
                    .header("Prefer", "resolution=ignore-duplicates,return=representation")
                    .json(&[candidate]);
                Self::send_json(builder).await
            })
            .await?;

        if let Some(thread) = inserted.into_iter().next() {
            debug!("thread created");
            return Ok(EnsuredThread { thread, created: true });
        }

        let thread = self
            .fetch_thread(&candidate.thread_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("thread {}", candidate.thread_id)))?;
        Ok(EnsuredThread { thread, created: false })
    }

    #[instrument(skip(self, new), fields(thread_id = %thread_id, role = %new.role))]
    async fn append_message(&self, thread_id: &ThreadId, new: NewMessage) -> Result<Message, StoreError> {
        let message_id = MessageId::new();

        for attempt in 1..=SEQUENCE_ATTEMPTS {
            let sequence = self.next_sequence(thread_id).await?;
            let row = new
                .clone()
                .into_message(message_id.clone(), thread_id.clone(), sequence, now_timestamp());

            let builder = self
                .request(reqwest::Method::POST, &self.messages_table)?
                .header("Prefer", "return=representation")
                .json(&[&row]);

            match Self::send_json::<Vec<Message>>(builder).await {
                Ok(stored) => {
                    let message = stored.into_iter().next().unwrap_or(row);
                    if let Err(e) = self
                        .patch_thread(thread_id, json!({ "last_active_at": message.created_at }))
                        .await
                    {
                        warn!(error = %e, "failed to bump thread activity");
                    }
                    return Ok(message);
                }
                Err(StoreError::Remote { status, body }) if status == StatusCode::CONFLICT.as_u16() => {
                    let pg = pg_error(&body);
                    match pg.code.as_deref() {
                        Some(FOREIGN_KEY_VIOLATION) => {
                            return Err(StoreError::NotFound(format!("thread {thread_id}")));
                        }
                        Some(UNIQUE_VIOLATION) if body.contains(&format!("{}_pkey", self.messages_table)) => {
                            return Err(StoreError::Conflict(format!("message {message_id} already stored")));
                        }
                        Some(UNIQUE_VIOLATION) => {
                            debug!(attempt, sequence, "sequence taken, retrying");
                        }
                        _ => {
                            return Err(StoreError::Conflict(pg.message.unwrap_or(body)));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict(format!(
            "no free sequence for thread {thread_id} after {SEQUENCE_ATTEMPTS} attempts"
        )))
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, limit))]
    async fn list_messages(&self, thread_id: &ThreadId, limit: Option<u32>) -> Result<Vec<Message>, StoreError> {
        let mut messages: Vec<Message> = self
            .with_retry(move || async move {
                let mut query = vec![("thread_id", format!("eq.{thread_id}"))];
                match limit {
                    Some(n) => {
                        query.push(("order", "sequence.desc".into()));
                        query.push(("limit", n.to_string()));
                    }
                    None => query.push(("order", "sequence.asc".into())),
                }
                let builder = self.request(reqwest::Method::GET, &self.messages_table)?.query(&query);
                Self::send_json(builder).await
            })
            .await?;
        if limit.is_some() {
            messages.reverse();
        }
        Ok(messages)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        self.fetch_thread(thread_id).await
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn update_group_name(&self, thread_id: &ThreadId, group_name: &str) -> Result<(), StoreError> {
        let updated = self.patch_thread(thread_id, json!({ "group_name": group_name })).await?;
        if updated.is_empty() {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_threads(&self, robot_code: &str, scope: Option<ConversationScope>) -> Result<Vec<Thread>, StoreError> {
        self.with_retry(move || async move {
            let mut query = vec![
                ("robot_code", format!("eq.{robot_code}")),
                ("order", "last_active_at.desc".to_string()),
            ];
            if let Some(scope) = scope {
                query.push(("conversation_type", format!("eq.{scope}")));
            }
            let builder = self.request(reqwest::Method::GET, &self.threads_table)?.query(&query);
            Self::send_json(builder).await
        })
        .await
    }

    async fn health_check(&self) -> bool {
        let result = match self.request(reqwest::Method::GET, &self.threads_table) {
            Ok(builder) => Self::send(builder.query(&[("select", "thread_id"), ("limit", "1")])).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "remote store health check failed");
                false
            }
        }
    }
}
