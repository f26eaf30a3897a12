use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use sync_api::{run as run_api, ApiState};
use sync_core::{Config, SyncContext, SystemClock};
use sync_feed::{ChangeFeed, ConnectionMonitor, MonitorConfig, RedisFeed};
use sync_sweep::{scheduler, PgRequestStore, Sweeper};

#[cfg(feature = "redpanda")]
fn change_feed(ctx: &SyncContext) -> Arc<dyn ChangeFeed> {
    match &ctx.config.realtime.redpanda_brokers {
        Some(brokers) => {
            tracing::info!("Using Redpanda change feed at {}", brokers);
            Arc::new(sync_feed::RedpandaFeed::new(brokers.clone(), &ctx.config.realtime))
        }
        None => redis_feed(ctx),
    }
}

#[cfg(not(feature = "redpanda"))]
fn change_feed(ctx: &SyncContext) -> Arc<dyn ChangeFeed> {
    redis_feed(ctx)
}

fn redis_feed(ctx: &SyncContext) -> Arc<dyn ChangeFeed> {
    tracing::info!("Using Redis stream change feed");
    Arc::new(RedisFeed::new(ctx.redis_pool.clone(), &ctx.config.realtime))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting marketplace sync server");

    let config = Config::from_env();
    let ctx = SyncContext::new(config).await?;

    tracing::info!("Sync context initialized");

    let sweeper = Arc::new(Sweeper::new(
        Arc::new(PgRequestStore::new(ctx.db_pool.clone())),
        Arc::new(SystemClock),
        ctx.config.sweep.clone(),
    ));

    if ctx.config.sweep.enabled {
        let interval = Duration::from_secs(ctx.config.sweep.interval_secs.max(1));
        tokio::spawn(scheduler::run(sweeper.clone(), interval));
    } else {
        tracing::info!("Scheduled sweep disabled, /cron/expire-requests still available");
    }

    let monitor = ConnectionMonitor::start(change_feed(&ctx), MonitorConfig::from(&ctx.config.realtime));
    let mut status = monitor.watch_debounced();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if current.is_degraded() {
                tracing::warn!("Change feed connection {:?}", current);
            } else {
                tracing::info!("Change feed connection {:?}", current);
            }
        }
    });

    let state = ApiState::new(ctx.config.cron.clone(), sweeper);
    tokio::select! {
        result = run_api(state, &ctx.config.server) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
    }

    drop(monitor);
    Ok(())
}
