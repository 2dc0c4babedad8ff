// Clima Agent -- Background sweeper
//
// Periodic housekeeping:
// - fails tasks whose deadline passed (including ones never claimed)
// - purges finished tasks older than the retention period
// - drops expired cache entries and idle rate-limit windows

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::TaskConfig;
use crate::dispatcher::Dispatcher;

pub fn spawn(
    dispatcher: Arc<Dispatcher>,
    config: TaskConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("sweeper: started (interval={}s)", config.sweep_interval.as_secs());

        let mut interval = tokio::time::interval(config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_once(&dispatcher, &config);
                }
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::info!("sweeper: stopped");
    })
}

/// What one pass removed or failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub purged: usize,
    pub cache_expired: usize,
    pub idle_callers: usize,
}

/// One housekeeping pass against the wall clock.
pub fn sweep_once(dispatcher: &Dispatcher, config: &TaskConfig) -> SweepReport {
    sweep_at(dispatcher, config, Utc::now())
}

/// Task deadlines and retention are judged against `now`; the cache and the
/// limiter use their own monotonic clock.
pub fn sweep_at(dispatcher: &Dispatcher, config: &TaskConfig, now: DateTime<Utc>) -> SweepReport {
    let report = SweepReport {
        timed_out: dispatcher.tasks().sweep_expired(now),
        purged: dispatcher.tasks().purge_finished(now, config.retention),
        cache_expired: dispatcher.cache().purge_expired(),
        idle_callers: dispatcher.limiter().prune_idle(),
    };

    if report.timed_out > 0 || report.purged > 0 {
        tracing::info!(
            "sweeper: timed_out={} purged={} cache_expired={} idle_callers={}",
            report.timed_out,
            report.purged,
            report.cache_expired,
            report.idle_callers
        );
    } else {
        tracing::debug!(
            "sweeper: nothing to do (cache_expired={} idle_callers={})",
            report.cache_expired,
            report.idle_callers
        );
    }
    report
}
