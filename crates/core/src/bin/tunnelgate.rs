use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tunnelgate::{
    bandwidth::{AllowanceScheduler, TokenBucketLimiter},
    config::{Config, ConfigArgs, SharedConfig},
    dispatch::Dispatcher,
    peer::{InMemoryBanlist, PeerId},
    transport::{ConnectivityStatus, ReachabilityTracker},
};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

async fn run(config: Config) -> anyhow::Result<()> {
    let shared = SharedConfig::new(config.clone());
    let limiter = Arc::new(TokenBucketLimiter::new());
    let scheduler = Arc::new(
        AllowanceScheduler::new(Arc::new(shared.clone()), limiter.clone())
            .context("failed to start the allowance scheduler")?,
    );
    let scheduler_task = scheduler.clone().spawn();

    let banlist = Arc::new(InMemoryBanlist::new());
    // no transport reports connectivity yet
    let (_status_tx, status) = watch::channel(ConnectivityStatus::Unknown);
    let reachability = Arc::new(ReachabilityTracker::new(
        &config.reachability,
        banlist.clone(),
        status,
    ));
    let stop_sweeper = Arc::new(AtomicBool::new(false));
    let sweeper_task = reachability.clone().spawn_sweeper(stop_sweeper.clone());

    let dispatcher = Dispatcher::builder(PeerId::random(), banlist, reachability)
        .settings(&config.dispatch)
        .allow_local(config.reachability.allow_local)
        .build();
    tracing::info!(
        router = %dispatcher.self_id(),
        rates = ?scheduler.rates(),
        "Router core started"
    );

    let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
    status_interval.tick().await;
    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                let estimator = scheduler.congestion_estimator();
                let (unreachable, was_unreachable) = dispatcher.reachability().tracked();
                tracing::info!(
                    participating_bps = scheduler.current_participating_bandwidth(),
                    queue_bytes = scheduler.participating_queue_bytes(),
                    unreachable,
                    was_unreachable,
                    stats = ?scheduler.stats(),
                    "{estimator}"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    scheduler.shutdown();
    stop_sweeper.store(true, Ordering::Release);
    scheduler_task.await.context("allowance scheduler panicked")?;
    sweeper_task.abort();
    let _ = sweeper_task.await;
    tracing::info!(dispatch = ?dispatcher.stats(), "Stopped");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = ConfigArgs::parse().build()?;
    tunnelgate::tracing::tracer::init_tracer(Some(config.log_level))?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    rt.block_on(run(config))
}
