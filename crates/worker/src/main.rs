use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinError;

use pushq_common::config::AppConfig;
use pushq_common::error::AppError;
use pushq_common::{db, redis_pool};
use pushq_engine::claim::{DispatchClaim, NoopClaim, RedisClaim};
use pushq_engine::dispatcher::Dispatcher;
use pushq_engine::listener::DispatchListener;
use pushq_engine::store::{PgQueueStore, QueueStore};
use pushq_engine::sweeper::Sweeper;
use pushq_gateway::FcmGateway;
use pushq_gateway::auth::ServiceAccountKey;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pushq_worker=info,pushq_engine=info,pushq_gateway=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Push dispatch worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply the schema
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn QueueStore> =
        Arc::new(PgQueueStore::new(pool, config.retention.window));

    // FCM gateway from the service account key
    let key = ServiceAccountKey::from_file(&config.credentials_path).await?;
    let gateway = Arc::new(FcmGateway::new(
        key,
        config.fcm_project_id.clone(),
        &config.fcm_base_url,
    )?);

    // Cross-process dispatch claim when Redis is available
    let claim: Arc<dyn DispatchClaim> = match &config.redis_url {
        Some(url) => {
            let redis = redis_pool::create_redis_pool(url).await?;
            Arc::new(RedisClaim::new(redis, config.dispatch.claim_ttl))
        }
        None => {
            tracing::warn!("REDIS_URL not set, concurrent duplicate deliveries are not suppressed");
            Arc::new(NoopClaim)
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        gateway,
        claim,
        config.dispatch.clone(),
    ));
    let listener = DispatchListener::new(dispatcher);
    let sweeper = Sweeper::new(store, config.retention.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_shutdown = shutdown_rx.clone();
    let mut listener_task = tokio::spawn(async move { listener.run(listener_shutdown).await });
    let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    // Run until Ctrl+C or the listener gives up
    let listener_result = tokio::select! {
        result = &mut listener_task => Some(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    let failure = match listener_result {
        Some(result) => listener_failure(result, false),
        None => listener_failure(listener_task.await, true),
    };

    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "Retention sweeper task panicked");
    }

    if let Some(e) = failure {
        tracing::error!(error = %e, "Push dispatch worker stopped on failure");
        return Err(e);
    }

    tracing::info!("Push dispatch worker stopped.");
    Ok(())
}

/// The error the process should exit with, given how the listener task ended.
///
/// A clean return only counts as success when shutdown was requested; otherwise the
/// event stream ended underneath the worker.
fn listener_failure(
    result: Result<Result<(), AppError>, JoinError>,
    shutdown_requested: bool,
) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) if shutdown_requested => None,
        Ok(Ok(())) => Some(anyhow::anyhow!("dispatch listener stopped unexpectedly")),
        Ok(Err(e)) => Some(anyhow::Error::new(e).context("dispatch listener failed")),
        Err(e) => Some(anyhow::Error::new(e).context("dispatch listener task panicked")),
    }
}
