//! Envelope handler trait.
//!
//! The [`TaskConsumer`](crate::consumer::TaskConsumer) owns the
//! subscribe-process-reconnect loop; an `EnvelopeHandler` owns what happens
//! to a single envelope. The replay executor in `deferred-web` is the
//! production implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use deferred_runtime::{EnvelopeHandler, HandlerError};
//!
//! struct LogOnly;
//!
//! #[async_trait]
//! impl EnvelopeHandler for LogOnly {
//!     async fn handle(&self, envelope: &DispatchEnvelope) -> Result<(), HandlerError> {
//!         tracing::info!(task_id = %envelope.task_id, "Got envelope");
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use deferred_core::{DispatchEnvelope, StoreError};
use thiserror::Error;

/// Errors returned by an [`EnvelopeHandler`].
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Replaying the request failed; a redelivery may succeed.
    #[error("Replay failed: {0}")]
    Replay(String),

    /// The status store rejected a write.
    #[error("Status store error: {0}")]
    Store(#[from] StoreError),

    /// The envelope can never succeed; do not redeliver.
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Whether the consumer should redeliver the envelope.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Processes one delivered envelope.
///
/// Handlers must be idempotent: with at-least-once delivery the same envelope
/// can arrive more than once, and the consumer redelivers on error.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handle one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when processing failed. Retryable errors are
    /// redelivered according to the consumer's
    /// [`RetryPolicy`](crate::retry::RetryPolicy).
    async fn handle(&self, envelope: &DispatchEnvelope) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(HandlerError::Replay("boom".to_string()).is_retryable());
        assert!(HandlerError::Store(StoreError::OperationFailed("down".to_string())).is_retryable());
        assert!(!HandlerError::Permanent("bad payload".to_string()).is_retryable());
    }
}
