use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use parley_core::retry::RetryError;
use parley_core::{ChatMessage, GatewayError, GenerationParams, ModelProvider, RetryPolicy};

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub retry: RetryPolicy,
    /// Consecutive failed invocations that open the circuit.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a [`ModelProvider`] with bounded retry and a circuit breaker.
///
/// - Retryable errors are retried with exponential backoff + jitter,
///   honoring `Retry-After` hints, up to `retry.max_attempts` attempts.
/// - Exhaustion yields [`GatewayError::Unavailable`]; fatal errors pass
///   through unchanged after one attempt.
/// - N consecutive failed invocations open the circuit; after the
///   cooldown a single trial call decides between closed and open.
pub struct ReliableProvider<P: ModelProvider> {
    inner: P,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
}

impl<P: ModelProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.circuit_state.write();
        let trip = *state == CircuitState::HalfOpen
            || (*state == CircuitState::Closed && failures >= self.config.circuit_breaker_threshold);
        if trip {
            warn!(
                failures,
                cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                "circuit breaker opened"
            );
            *state = CircuitState::Open { since: Instant::now() };
        }
    }

    fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<String, GatewayError> {
        self.check_circuit()?;

        let result = self
            .config
            .retry
            .run_with_hint(GatewayError::is_retryable, GatewayError::suggested_delay, |_| {
                self.inner.complete(messages, params)
            })
            .await;

        match result {
            Ok(text) => {
                self.record_success();
                Ok(text)
            }
            Err(RetryError { attempts, error }) => {
                self.record_failure();
                if !error.is_retryable() {
                    return Err(error);
                }
                warn!(
                    attempts,
                    error = %error,
                    kind = error.error_kind(),
                    circuit = self.circuit_state_name(),
                    "model unavailable"
                );
                Err(GatewayError::Unavailable {
                    attempts,
                    last: Box::new(error),
                })
            }
        }
    }
}
