use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use parley_core::{CharEstimator, ConversationScope};
use parley_engine::{ChatHandler, HandlerConfig, LogReplySink, ReplySink};
use parley_llm::{OpenAiCompatConfig, OpenAiCompatProvider, ReliableConfig, ReliableProvider};
use parley_server::{AppState, ServerConfig, WebhookConfig, WebhookReplySink};
use parley_settings::Settings;
use parley_store::{HistoryStore, StoreBackend};
use parley_telemetry::{init_telemetry, TelemetryConfig};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Chat bot with per-conversation memory")]
struct Cli {
    /// Settings file. Defaults to the standard lookup order.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => parley_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => parley_settings::load_settings().context("loading settings")?,
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    settings.validate().context("invalid settings")?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: TelemetryConfig::parse_level(&settings.logging.level),
        module_levels: TelemetryConfig::parse_module_levels(&settings.logging.modules),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: PathBuf::from(&settings.logging.log_db_path),
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting parley");

    let store = Arc::new(StoreBackend::from_settings(&settings.database).context("opening store")?);
    tracing::info!(backend = store.kind(), "store ready");
    match store.list_threads(&settings.bot.robot_code, Some(ConversationScope::Group)).await {
        Ok(groups) => tracing::info!(robot = %settings.bot.robot_code, groups = groups.len(), "known groups loaded"),
        Err(e) => tracing::warn!(error = %e, "could not list known groups"),
    }

    let provider = OpenAiCompatProvider::new(OpenAiCompatConfig {
        endpoint: settings.model.model_endpoint.clone(),
        api_key: non_empty(&settings.model.model_key).map(|k| k.to_string().into()),
        request_timeout: settings.model.request_timeout(),
    })
    .context("building model client")?;
    let provider = ReliableProvider::new(
        provider,
        ReliableConfig {
            retry: settings.model.retry_policy(),
            circuit_breaker_threshold: settings.model.circuit_breaker_threshold,
            circuit_breaker_cooldown: Duration::from_secs(settings.model.circuit_breaker_cooldown_secs),
        },
    );

    let handler = ChatHandler::new(
        store.clone(),
        Arc::new(provider),
        reply_sink(&settings)?,
        Arc::new(CharEstimator),
        HandlerConfig::from_settings(&settings),
    );

    let shutdown = CancellationToken::new();
    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        ..Default::default()
    };
    let state = AppState::new(Arc::new(handler), store).with_logs(telemetry.logs());
    let handle = parley_server::start(server_config, state, shutdown.clone())
        .await
        .with_context(|| format!("binding {}:{}", settings.server.host, settings.server.port))?;

    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    handle.join().await;
    Ok(())
}

fn reply_sink(settings: &Settings) -> anyhow::Result<Arc<dyn ReplySink>> {
    match &settings.bot.reply_webhook_url {
        Some(url) => {
            let sink = WebhookReplySink::new(WebhookConfig {
                url: url.clone(),
                client_id: settings.bot.client_id.clone(),
                client_secret: non_empty(&settings.bot.client_secret).map(|s| s.to_string().into()),
                timeout: REPLY_TIMEOUT,
            })
            .context("building reply webhook client")?;
            Ok(Arc::new(sink))
        }
        None => {
            tracing::warn!("no reply webhook configured, replies are only logged");
            Ok(Arc::new(LogReplySink))
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}
