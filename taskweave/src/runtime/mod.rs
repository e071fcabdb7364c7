//! Background drivers: interval loops around the reconcile, download, and
//! function-sync cycles.
//!
//! The core services expose single-tick entry points; these loops are the
//! optional in-process driver. Each spawn returns a `JoinHandle` the caller
//! aborts on shutdown. Two drivers for the same service must not run
//! concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::download::DownloadOrchestrator;
use crate::functions::{CircuitBreaker, FunctionCache};
use crate::state::{Clock, RuntimeStateService, SystemClock};

/// Periodically runs the reconcile tick.
pub fn spawn_reconcile_loop(
    service: Arc<RuntimeStateService>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = service.run_backend_cycle(&cancel).await {
                warn!(error = %e, "reconcile tick failed");
            } else {
                debug!("reconcile tick completed");
            }
        }
    })
}

/// Periodically runs the single-download cycle.
pub fn spawn_download_loop(
    orchestrator: Arc<DownloadOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = orchestrator.run_download_cycle(&cancel).await {
                warn!(error = %e, "download cycle failed");
            }
        }
    })
}

/// Runs an initial function-cache sync, then periodic syncs guarded by the
/// circuit breaker.
pub fn spawn_function_sync_loop(
    cache: Arc<FunctionCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let breaker = CircuitBreaker::new();
    let clock = SystemClock;
    tokio::spawn(async move {
        // Initial sync before the periodic ticks.
        if let Err(e) = cache.sync_all().await {
            warn!(error = %e, "initial function sync failed");
            breaker.record_failure(&clock);
        } else {
            breaker.record_success();
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !breaker.allow(clock.now()) {
                debug!("function sync skipped: circuit open");
                continue;
            }
            match cache.sync_all().await {
                Ok(report) => {
                    breaker.record_success();
                    debug!(compiled = report.compiled, removed = report.removed, "function sync tick");
                }
                Err(e) => {
                    warn!(error = %e, "function sync failed");
                    breaker.record_failure(&clock);
                }
            }
        }
    })
}
