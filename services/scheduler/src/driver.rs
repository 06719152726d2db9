//! services/scheduler/src/driver.rs
//!
//! Drives `SchedulerCore` ticks: either once, or at every minute boundary
//! until shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use repetition_core::{Clock, SchedulerCore, TickReport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The start of the minute after `now`.
pub fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let minute = TimeDelta::minutes(1);
    match now.duration_trunc(minute) {
        Ok(start) => start + minute,
        Err(_) => now + minute,
    }
}

/// Runs a single tick at the clock's current instant.
pub async fn run_once(core: &SchedulerCore, clock: &dyn Clock) -> TickReport {
    let report = core.run_tick(clock.now()).await;
    log_report(&report);
    report
}

/// Ticks at every minute boundary until `shutdown` is cancelled.
///
/// Minutes that pass while a tick is still running are not caught up. A tick
/// in flight when shutdown arrives is allowed to finish.
pub async fn run_loop(core: Arc<SchedulerCore>, clock: Arc<dyn Clock>, shutdown: CancellationToken) {
    info!("Scheduler loop started.");

    loop {
        let now = clock.now();
        let tick_at = next_minute(now);
        let wait = (tick_at - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested; scheduler loop stopping.");
                break;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        // Timers may fire a hair early; never tick before the boundary.
        let now = clock.now().max(tick_at);
        let report = core.run_tick(now).await;
        log_report(&report);
    }
}

fn log_report(report: &TickReport) {
    if report.failed > 0 || report.notification_failures > 0 {
        warn!(
            candidates = report.candidates,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            notification_failures = report.notification_failures,
            "Tick finished with failures"
        );
    } else {
        info!(
            candidates = report.candidates,
            processed = report.processed,
            skipped = report.skipped,
            notified = report.notified,
            "Tick finished"
        );
    }
}
