//! Replaying deferred requests against the in-process application.
//!
//! # Lifecycle
//!
//! ```text
//! RECEIVED ──► PROCESSING ──┬──► COMPLETED (replay outcome)
//!                           └──► FAILED    ({"error": message})
//! ```
//!
//! The executor is the [`EnvelopeHandler`] of the consumer pool. A failed
//! replay is recorded as FAILED and the error is returned so the consumer's
//! redelivery policy applies; a later success overwrites it with COMPLETED.
//! The application sees the replayed request exactly as a normal call, with
//! the marker header set so the gate lets it through.

use crate::codec::{collect_response, synthetic_request, CodecError};
use crate::notifier::StatusNotifier;
use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response};
use deferred_core::{DispatchEnvelope, ReplayOutcome, StoreError};
use deferred_runtime::{EnvelopeHandler, HandlerError};
use futures::FutureExt;
use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tower::{util::BoxCloneService, Service, ServiceExt};

/// Type-erased application service (any `axum::Router` fits).
pub type AppService = BoxCloneService<Request<Body>, Response, Infallible>;

/// Why a replay did not produce an outcome.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The payload could not be replayed, or the response could not be read.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The application panicked while handling the replayed request.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// The status store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ExecutionError> for HandlerError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Codec(e @ CodecError::ResponseBody(_)) => Self::Replay(e.to_string()),
            ExecutionError::Codec(e) => Self::Permanent(e.to_string()),
            ExecutionError::Panicked(message) => Self::Replay(message),
            ExecutionError::Store(e) => Self::Store(e),
        }
    }
}

/// Replays envelopes through the application and records the outcome.
pub struct ReplayExecutor {
    // BoxCloneService is Send but not Sync; each replay clones it out.
    app: Mutex<AppService>,
    notifier: StatusNotifier,
}

impl ReplayExecutor {
    /// Create an executor for `app`.
    pub fn new<S>(app: S, notifier: StatusNotifier) -> Self
    where
        S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            app: Mutex::new(BoxCloneService::new(app)),
            notifier,
        }
    }

    /// Run one envelope through the full lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError`] if the replay failed (after recording
    /// FAILED) or a status write failed.
    pub async fn execute(&self, envelope: &DispatchEnvelope) -> Result<ReplayOutcome, ExecutionError> {
        let task_id = envelope.task_id;
        let channel = envelope.channel_name.as_str();

        tracing::info!(
            task_id = %task_id,
            method = %envelope.payload.method,
            path = %envelope.payload.path,
            partition_marker = ?envelope.partition_marker,
            "Replaying deferred request"
        );
        self.notifier.processing(task_id, channel).await?;

        match self.replay(envelope).await {
            Ok(outcome) => {
                metrics::counter!("deferred.replay.completed").increment(1);
                tracing::info!(task_id = %task_id, status = outcome.status, "Deferred request completed");
                self.notifier.completed(task_id, channel, &outcome).await?;
                Ok(outcome)
            },
            Err(e) => {
                metrics::counter!("deferred.replay.failed").increment(1);
                tracing::error!(task_id = %task_id, error = %e, "Deferred request failed");
                self.notifier.failed(task_id, channel, &e).await?;
                Err(e)
            },
        }
    }

    async fn replay(&self, envelope: &DispatchEnvelope) -> Result<ReplayOutcome, ExecutionError> {
        let request = synthetic_request(&envelope.payload)?;
        let app = self
            .app
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let response = AssertUnwindSafe(app.oneshot(request))
            .catch_unwind()
            .await
            .map_err(|panic| ExecutionError::Panicked(panic_message(&*panic)))?
            .unwrap_or_else(|never| match never {});

        Ok(collect_response(envelope.task_id, &envelope.payload.path, response).await?)
    }
}

#[async_trait]
impl EnvelopeHandler for ReplayExecutor {
    async fn handle(&self, envelope: &DispatchEnvelope) -> Result<(), HandlerError> {
        self.execute(envelope).await.map(|_| ()).map_err(HandlerError::from)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
