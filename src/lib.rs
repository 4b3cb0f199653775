use rocket::Config;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};

use reconciler_exchange::{Exchange, PaperConfig, PaperExchange};

pub mod activity;
pub mod api;
pub mod breaker;
mod db_utils;
pub mod env;
pub mod error;
pub mod guarded;
pub mod metrics;
pub mod order;
pub mod reconciler;
pub mod retry;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

use crate::api::DynBreakerControl;
use crate::env::Env;
use crate::guarded::GuardedExchange;
use crate::metrics::MetricsRegistry;
use crate::reconciler::ReconciliationWorker;

/// Runs the service until SIGINT or SIGTERM. Expects an already validated
/// [`Env`].
pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;

    sqlx::migrate!().run(&pool).await?;

    let exchange = PaperExchange::try_from_config(PaperConfig::default()).await?;
    info!("Initialized {} exchange", exchange.to_supported_exchange());

    let metrics = Arc::new(MetricsRegistry::new());
    let retry_policy = env.retry_policy();
    info!(
        "Exchange calls retry up to {} times with delays {:?}",
        retry_policy.max_retries,
        retry_policy.schedule()
    );
    let guarded = Arc::new(GuardedExchange::new(
        Arc::new(exchange),
        &env.breaker_config(),
        retry_policy,
        &metrics,
    ));

    let config = Config::figment()
        .merge(("port", env.status_port))
        .merge(("address", "0.0.0.0"));

    let breaker_control: DynBreakerControl = guarded.clone();
    let rocket = rocket::custom(config)
        .mount("/", api::routes())
        .manage(metrics.clone())
        .manage(breaker_control);

    let server_task = tokio::spawn(rocket.launch());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ReconciliationWorker::new(
        env.reconciler_config(),
        pool.clone(),
        guarded,
        metrics,
        shutdown_rx,
    );
    let mut worker_task = tokio::spawn(worker.run());

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }

        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }

        result = server_task => {
            match result {
                Ok(Ok(_)) => info!("Status server completed"),
                Ok(Err(e)) => error!("Status server failed: {e}"),
                Err(e) => error!("Status server task panicked: {e}"),
            }
        }

        result = &mut worker_task => {
            if let Err(e) = result {
                error!("Reconciliation worker panicked: {e}");
            }
            pool.close().await;
            anyhow::bail!("Reconciliation worker stopped unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_task.await {
        error!("Reconciliation worker panicked during shutdown: {e}");
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
