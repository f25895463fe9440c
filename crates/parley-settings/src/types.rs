//! Settings type definitions.
//!
//! Every section implements [`Default`] with production defaults and is
//! marked `#[serde(default)]`, so a settings file only needs the keys it
//! overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_core::provider::GenerationParams;
use parley_core::retry::RetryPolicy;

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub model: ModelSettings,
    pub context: ContextSettings,
    pub bot: BotSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

/// Which persistence backend to use. Resolved once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Remote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub database_type: DatabaseType,
    /// Path of the embedded database file.
    pub sqlite_path: String,
    /// Base URL of the hosted REST store (e.g. `https://xyz.supabase.co`).
    pub remote_url: Option<String>,
    /// Service key sent as `apikey` and bearer token.
    pub remote_key: Option<String>,
    pub threads_table: String,
    pub messages_table: String,
    pub remote_timeout_secs: u64,
    /// Attempts for idempotent remote reads.
    pub read_attempts: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::Sqlite,
            sqlite_path: "parley.db".to_string(),
            remote_url: None,
            remote_key: None,
            threads_table: "threads".to_string(),
            messages_table: "messages".to_string(),
            remote_timeout_secs: 10,
            read_attempts: 3,
        }
    }
}

impl DatabaseSettings {
    pub fn read_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.read_attempts,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Chat-completions endpoint URL.
    pub model_endpoint: String,
    pub model_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub request_timeout_secs: u64,
    /// Total attempts per invocation, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed invocations before the circuit opens.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_endpoint: String::new(),
            model_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 1.0,
            request_timeout_secs: 60,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60,
        }
    }
}

impl ModelSettings {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Total prompt budget in tokens, system prompt included.
    pub max_context_tokens: u32,
    /// Tokens held back from the budget for the model's reply.
    pub reserve_tokens: u32,
    /// Cap on how many recent messages are loaded before trimming.
    pub history_limit: Option<u32>,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_000,
            reserve_tokens: 4_000,
            history_limit: Some(200),
            system_prompt: None,
        }
    }
}

impl ContextSettings {
    /// Budget handed to the context builder.
    pub fn history_budget(&self) -> u32 {
        self.max_context_tokens.saturating_sub(self.reserve_tokens)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    pub robot_code: String,
    pub robot_name: String,
    pub client_id: String,
    pub client_secret: String,
    /// Outbound reply webhook. Replies are only logged when unset.
    pub reply_webhook_url: Option<String>,
    /// Sent once when a direct thread is created.
    pub welcome_message: Option<String>,
    /// Sent instead of a reply when the model cannot be reached.
    pub apology_message: String,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            robot_code: String::new(),
            robot_name: "Parley".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            reply_webhook_url: None,
            welcome_message: Some(
                "Hi! I can answer questions, look things up and help with everyday tasks. What can I do for you?"
                    .to_string(),
            ),
            apology_message: "Sorry, I ran into a problem while handling your request. Please try again later."
                .to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// Persist warn+ events to a SQLite log database.
    pub persist_warnings: bool,
    pub log_db_path: String,
    /// Per-module levels, e.g. `{"parley_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist_warnings: true,
            log_db_path: "logs/parley-logs.db".to_string(),
            modules: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Reject combinations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.model.model_endpoint.trim().is_empty() {
            return Err(SettingsError::InvalidValue("model.model_endpoint is required".into()));
        }
        if self.bot.robot_code.trim().is_empty() {
            return Err(SettingsError::InvalidValue("bot.robot_code is required".into()));
        }
        if self.database.database_type == DatabaseType::Remote
            && self.database.remote_url.as_deref().is_none_or(|u| u.trim().is_empty())
        {
            return Err(SettingsError::InvalidValue(
                "database.remote_url is required when database_type is remote".into(),
            ));
        }
        if self.context.history_budget() == 0 {
            return Err(SettingsError::InvalidValue(format!(
                "context.max_context_tokens ({}) must exceed context.reserve_tokens ({})",
                self.context.max_context_tokens, self.context.reserve_tokens
            )));
        }
        if self.model.max_attempts == 0 {
            return Err(SettingsError::InvalidValue("model.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
