//! Fixed-delay scheduling of reconciliation passes.
//!
//! The first pass runs after `initial_delay`; each later pass starts
//! `period` after the previous one finished. Nothing a pass does can stop
//! the schedule: errors are already absorbed by the reconciler, and a panic
//! inside a pass is caught, logged, and followed by the next tick. Only the
//! shutdown signal ends the loop.

use crate::config::ScheduleConfig;
use crate::reconciler::Reconciler;
use crate::shutdown::ShutdownSignal;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[cfg(test)]
#[path = "schedule_tests.rs"]
mod tests;

/// Cadence of the reconciliation task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl From<&ScheduleConfig> for ReconcileSchedule {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            period: config.period(),
        }
    }
}

/// Final numbers reported when the schedule stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub passes: u64,
    pub acknowledged: u64,
    pub rebinds: u64,
    pub panicked_passes: u64,
    /// Entries left unacknowledged; the broker redelivers them later
    pub abandoned: usize,
}

/// Run passes on `schedule` until `shutdown` fires, then close the receiver
pub async fn run_schedule(
    mut reconciler: Reconciler,
    schedule: ReconcileSchedule,
    mut shutdown: ShutdownSignal,
) -> ShutdownSummary {
    let mut panicked_passes = 0;

    info!(
        queue = %reconciler.endpoint(),
        initial_delay_ms = schedule.initial_delay.as_millis() as u64,
        period_ms = schedule.period.as_millis() as u64,
        "Reconciliation schedule started"
    );

    let mut delay = schedule.initial_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.triggered() => break,
        }

        let pass = AssertUnwindSafe(reconciler.run_pass_until(&mut shutdown))
            .catch_unwind()
            .await;
        if let Err(panic) = pass {
            panicked_passes += 1;
            error!(
                queue = %reconciler.endpoint(),
                panic = %panic_message(panic.as_ref()),
                "Reconciliation pass panicked; schedule continues"
            );
        }

        delay = schedule.period;
    }

    let abandoned = reconciler.shutdown().await;
    let stats = reconciler.stats();
    let summary = ShutdownSummary {
        passes: stats.passes,
        acknowledged: stats.acknowledged,
        rebinds: stats.rebinds,
        panicked_passes,
        abandoned,
    };

    info!(
        queue = %reconciler.endpoint(),
        passes = summary.passes,
        acknowledged = summary.acknowledged,
        rebinds = summary.rebinds,
        abandoned = summary.abandoned,
        "Reconciliation schedule stopped"
    );

    summary
}

/// Spawn [`run_schedule`] on its own task
pub fn spawn_reconciler(
    reconciler: Reconciler,
    schedule: ReconcileSchedule,
    shutdown: ShutdownSignal,
) -> JoinHandle<ShutdownSummary> {
    tokio::spawn(run_schedule(reconciler, schedule, shutdown))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
