//! Periodic eviction of idle peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::announce_members;
use crate::hub::{Hub, SweepReport};

/// Default time between sweeps; also the default idle threshold.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

pub fn spawn_sweeper(
    hub: Arc<Hub>,
    settings: SweepSettings,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_sweeper(hub, settings, shutdown))
}

/// Sweeps every `settings.interval` until `shutdown` fires.
pub async fn run_sweeper(hub: Arc<Hub>, settings: SweepSettings, shutdown: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        interval = ?settings.interval,
        idle_timeout = ?settings.idle_timeout,
        "eviction sweeper started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                sweep_once(&hub, settings.idle_timeout, Instant::now()).await;
            }
        }
    }

    info!("eviction sweeper stopped");
}

/// Runs one sweep at `now` and announces the new membership of every channel
/// that lost peers. The registry lock is released before any announcement is
/// written.
pub async fn sweep_once(hub: &Hub, idle_timeout: Duration, now: Instant) -> SweepReport {
    let report = hub.sweep_expired(idle_timeout, now).await;

    for update in &report.updated {
        announce_members(hub, &update.channel_id, &update.peer_ids).await;
    }

    if !report.evicted.is_empty() {
        let stats = hub.stats().await;
        info!(
            evicted = report.evicted.len(),
            channels = stats.channels,
            peers = stats.peers,
            "sweep finished"
        );
    } else {
        debug!("sweep found no idle peers");
    }
    report
}
