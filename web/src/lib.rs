//! Axum integration for deferred request execution.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  HTTP side (request runtime)                 │
//! │  DeferralLayer ─► ChannelResolver            │  ← 401 without identity
//! │        │        ─► codec::capture            │  ← snapshot, marker header
//! │        └──────── ─► Dispatcher ─► broker     │  ← 202 + task id
//! ├──────────────────────────────────────────────┤
//! │  Consumer side (deferred-runtime pool)       │
//! │  ReplayExecutor ─► codec::synthetic_request  │
//! │        │        ─► app (same Router)         │  ← passes the gate as a replay
//! │        └──────── ─► StatusNotifier           │  ← record + channel event
//! ├──────────────────────────────────────────────┤
//! │  Result endpoint                             │  ← owner-only, 200/202/403/404
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use deferred_web::{deferral_layer, handlers, DeferralConfig, DeferredState, ReplayExecutor, StatusNotifier};
//!
//! let state = DeferredState::new(DeferralConfig::default(), broker, store.clone(), resolver);
//!
//! let app = Router::new()
//!     .route("/api/v1/some-async-endpoint/", get(some_async_endpoint))
//!     .merge(handlers::routes(state.clone()))
//!     .layer(deferral_layer(state));
//!
//! // Replays go through the same router, gate included.
//! let executor = Arc::new(ReplayExecutor::new(app.clone(), StatusNotifier::new(store)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod notifier;
pub mod state;

// Re-export key types for convenience
pub use channel::{
    BearerChannelResolver, ChannelNameError, ChannelResolver, JwtVerifier, StaticTokenVerifier,
    TokenVerifier,
};
pub use codec::CodecError;
pub use dispatch::{DispatchError, Dispatcher};
pub use error::AppError;
pub use executor::{AppService, ExecutionError, ReplayExecutor};
pub use extractors::RequireDeferred;
pub use middleware::{deferral_layer, DeferralLayer, DeferredAccepted};
pub use notifier::StatusNotifier;
pub use state::{DeferralConfig, DeferredState};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
