//! Deferred request execution HTTP server.
//!
//! Serves the API behind the deferral gate and runs the replay consumers
//! that execute deferred requests in the background.

mod config;
mod routes;

use anyhow::Context;
use config::Config;
use deferred_core::{StatusStore, TaskBroker};
use deferred_redis::RedisStatusStore;
use deferred_redpanda::RedpandaTaskBroker;
use deferred_runtime::{
    await_shutdown, spawn_consumer_pool, ConsumerPoolConfig, EnvelopeHandler, RetryPolicy,
};
use deferred_web::{
    BearerChannelResolver, DeferralConfig, DeferredState, JwtVerifier, ReplayExecutor,
    StatusNotifier,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments set the environment.
    let _ = dotenvy::dotenv();

    init_tracing();
    info!("Starting deferred request server");

    let config = Config::from_env();
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        redis_url = %config.redis.url,
        deferral_enabled = config.redpanda.enabled,
        "Configuration loaded"
    );

    info!("Connecting to Redpanda...");
    let broker: Arc<dyn TaskBroker> = Arc::new(
        RedpandaTaskBroker::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.group_id)
            .auto_offset_reset(&config.redpanda.auto_offset_reset)
            .producer_acks(&config.redpanda.producer_acks)
            .build()
            .context("Failed to create Redpanda broker")?,
    );

    info!("Connecting to Redis...");
    let store: Arc<dyn StatusStore> = Arc::new(
        RedisStatusStore::new(&config.redis.url)
            .await
            .context("Failed to connect to Redis")?
            .with_key_prefix(&config.redis.key_prefix)
            .with_ttl(config.result_ttl()),
    );

    let resolver = Arc::new(
        BearerChannelResolver::new(JwtVerifier::new(config.auth.jwt_secret.as_bytes()))
            .with_prefix(&config.auth.channel_prefix),
    );

    let deferral = DeferralConfig::default()
        .with_enabled(config.redpanda.enabled)
        .with_topic(&config.redpanda.topic)
        .with_max_body_bytes(config.deferral.max_body_bytes);
    let state = DeferredState::new(deferral, Arc::clone(&broker), Arc::clone(&store), resolver);
    let app = routes::build_router(state);

    let (shutdown_tx, _) = broadcast::channel(1);
    let consumer_handles = if config.redpanda.enabled {
        let mut pool = ConsumerPoolConfig::new("replay", vec![config.redpanda.topic.clone()]);
        pool.retry_policy = RetryPolicy::new().with_max_attempts(config.deferral.replay_max_retries);

        let handler: Arc<dyn EnvelopeHandler> =
            Arc::new(ReplayExecutor::new(app.clone(), StatusNotifier::new(store)));
        spawn_consumer_pool(
            config.redpanda.consumer_count,
            &pool,
            &broker,
            &handler,
            &shutdown_tx,
        )
    } else {
        warn!("Deferred execution disabled, no replay consumers started");
        Vec::new()
    };

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(address = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server failed")?;

    info!("HTTP server stopped, draining replay consumers");
    // No receivers means no consumers were started.
    let _ = shutdown_tx.send(());
    await_shutdown(consumer_handles, config.shutdown_timeout()).await;

    info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "deferred_server=info,deferred_web=info,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
