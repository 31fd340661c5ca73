//! Handler contract shared by every pipeline consumer.

use crate::store::StoreError;
use async_trait::async_trait;
use thiserror::Error;

/// Failure classification that drives the dispatcher's retry decision
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Store or transport temporarily unavailable, or the invocation timed out
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Malformed input; retrying cannot help
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            HandlerError::Transient(reason) | HandlerError::Permanent(reason) => reason,
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

/// A stateless consumer of one event type.
///
/// Implementations must be idempotent: the feeds are at-least-once.
#[async_trait]
pub trait EventHandler<E>: Send + Sync
where
    E: Send + Sync,
{
    /// Stable name used in logs, metrics and dead letters
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}
