use parley_core::{GatewayError, IdentityError};
use parley_store::StoreError;

use crate::sink::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("model error: {0}")]
    Model(GatewayError),

    /// Retries exhausted. The user only ever sees the apology text.
    #[error("model unavailable: {0}")]
    ModelUnavailable(GatewayError),

    #[error("rejected inbound event: {0}")]
    Identity(#[from] IdentityError),

    #[error("reply delivery failed: {0}")]
    Transport(#[from] TransportError),
}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable { .. } => Self::ModelUnavailable(e),
            other => Self::Model(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exhausted_retries_map_to_unavailable() {
        let err: EngineError = GatewayError::Unavailable {
            attempts: 3,
            last: Box::new(GatewayError::Timeout(Duration::from_secs(1))),
        }
        .into();
        assert!(matches!(err, EngineError::ModelUnavailable(_)));

        let err: EngineError = GatewayError::CircuitOpen.into();
        assert!(matches!(err, EngineError::Model(GatewayError::CircuitOpen)));
    }
}
