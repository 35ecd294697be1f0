//! # Reconciler
//!
//! State machine that drains the [`PendingBuffer`] by acknowledging each
//! buffered message, and recovers from acknowledgment failures by rebinding
//! the receiver and rescanning from the head of the buffer.
//!
//! ```text
//! Idle -> Scanning -> AckOk   -> Scanning
//!                  -> AckFail -> (close, rebind, restart) -> Scanning
//!      -> Done (buffer empty, rebind limit reached, rebind failed, or shutdown)
//! ```
//!
//! A receiver the transport has closed on its own is discarded at the start
//! of the next pass and replaced by a fresh bind.
//!
//! A rebind makes the broker redeliver every unacknowledged message, which
//! may reorder or duplicate entries near the head of the buffer. Restarting
//! the scan at position 0 is what guarantees no pending entry is skipped.
//! Entries are only ever removed after their own acknowledgment succeeded.

use crate::buffer::PendingBuffer;
use crate::config::ReconcilerConfig;
use crate::connection::{Connection, Receiver};
use crate::delivery::DeliverySink;
use crate::error::BindError;
use crate::message::{BindingId, QueueEndpoint};
use crate::retry::RetryState;
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;

/// Current step of the reconciliation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    Scanning { position: usize },
    AckOk { position: usize },
    AckFail { position: usize },
    Done,
}

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing was pending when the pass started
    Empty,
    /// Every entry seen during the pass was acknowledged
    Drained,
    /// The pass used up its rebind allowance; the next tick continues
    RebindLimitReached,
    /// No receiver could be bound; the next tick retries the bind
    BindFailed,
    /// Shutdown was requested while the pass was running
    ShutdownRequested,
}

/// Summary of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub outcome: PassOutcome,
    pub acknowledged: usize,
    pub ack_failures: usize,
    pub rebinds: u32,
    /// Buffer size when the pass ended
    pub remaining: usize,
}

impl PassReport {
    fn new(outcome: PassOutcome) -> Self {
        Self {
            outcome,
            acknowledged: 0,
            ack_failures: 0,
            rebinds: 0,
            remaining: 0,
        }
    }
}

/// Running totals across passes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub passes: u64,
    pub acknowledged: u64,
    pub ack_failures: u64,
    pub rebinds: u64,
    pub bind_failures: u64,
}

impl ReconcilerStats {
    fn record(&mut self, report: &PassReport) {
        self.passes += 1;
        self.acknowledged += report.acknowledged as u64;
        self.ack_failures += report.ack_failures as u64;
        self.rebinds += u64::from(report.rebinds);
        if report.outcome == PassOutcome::BindFailed {
            self.bind_failures += 1;
        }
    }
}

/// Owner of the active receiver and driver of acknowledgments
pub struct Reconciler {
    connection: Arc<dyn Connection>,
    endpoint: QueueEndpoint,
    buffer: PendingBuffer,
    sink: DeliverySink,
    config: ReconcilerConfig,
    receiver: Option<Box<dyn Receiver>>,
    state: ReconcileState,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(
        connection: Arc<dyn Connection>,
        endpoint: QueueEndpoint,
        buffer: PendingBuffer,
        sink: DeliverySink,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            connection,
            endpoint,
            buffer,
            sink,
            config,
            receiver: None,
            state: ReconcileState::Idle,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    pub fn buffer(&self) -> &PendingBuffer {
        &self.buffer
    }

    pub fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }

    /// Binding id of the active receiver, if any
    pub fn active_binding(&self) -> Option<&BindingId> {
        self.receiver.as_ref().map(|receiver| receiver.binding_id())
    }

    /// Bind and start a receiver, replacing any active one
    pub async fn bind(&mut self) -> Result<(), BindError> {
        self.close_receiver().await;

        let receiver = self
            .connection
            .bind(&self.endpoint, self.sink.clone())
            .await?;

        if let Err(e) = receiver.start().await {
            receiver.close().await;
            return Err(BindError::StartFailed(e));
        }

        info!(
            queue = %self.endpoint,
            binding_id = %receiver.binding_id(),
            "Receiver bound and started"
        );
        self.receiver = Some(receiver);
        Ok(())
    }

    /// Close the active receiver; without one this is a no-op
    pub async fn close_receiver(&mut self) {
        match self.receiver.take() {
            Some(receiver) => {
                info!(
                    queue = %self.endpoint,
                    binding_id = %receiver.binding_id(),
                    "Closing receiver"
                );
                receiver.close().await;
            }
            None => debug!(queue = %self.endpoint, "No active receiver to close"),
        }
    }

    /// Acknowledge whatever is pending now
    pub async fn run_pass(&mut self) -> PassReport {
        self.execute_pass(None).await
    }

    /// Like [`Reconciler::run_pass`], but stops early once `shutdown` fires
    ///
    /// The signal is checked before each acknowledgment and interrupts the
    /// backoff sleep between rebinds.
    pub async fn run_pass_until(&mut self, shutdown: &mut ShutdownSignal) -> PassReport {
        self.execute_pass(Some(shutdown)).await
    }

    async fn execute_pass(&mut self, shutdown: Option<&mut ShutdownSignal>) -> PassReport {
        self.state = ReconcileState::Idle;
        let mut report = self.scan_and_acknowledge(shutdown).await;
        self.state = ReconcileState::Done;

        report.remaining = self.buffer.size();
        self.stats.record(&report);

        match report.outcome {
            PassOutcome::Empty => debug!(queue = %self.endpoint, "Nothing pending"),
            PassOutcome::Drained => info!(
                queue = %self.endpoint,
                acknowledged = report.acknowledged,
                rebinds = report.rebinds,
                remaining = report.remaining,
                "Reconciliation pass drained buffer"
            ),
            PassOutcome::RebindLimitReached => warn!(
                queue = %self.endpoint,
                acknowledged = report.acknowledged,
                rebinds = report.rebinds,
                remaining = report.remaining,
                "Rebind limit reached; continuing next tick"
            ),
            PassOutcome::BindFailed => warn!(
                queue = %self.endpoint,
                acknowledged = report.acknowledged,
                remaining = report.remaining,
                "No receiver bound; retrying next tick"
            ),
            PassOutcome::ShutdownRequested => info!(
                queue = %self.endpoint,
                acknowledged = report.acknowledged,
                rebinds = report.rebinds,
                remaining = report.remaining,
                "Reconciliation pass interrupted by shutdown"
            ),
        }

        report
    }

    async fn scan_and_acknowledge(
        &mut self,
        mut shutdown: Option<&mut ShutdownSignal>,
    ) -> PassReport {
        if self
            .receiver
            .as_ref()
            .is_some_and(|receiver| receiver.is_closed())
        {
            warn!(
                queue = %self.endpoint,
                "Receiver was closed by the transport; replacing it"
            );
            self.close_receiver().await;
        }

        if self.receiver.is_none() {
            if let Err(e) = self.bind().await {
                error!(queue = %self.endpoint, error = %e, "Failed to bind receiver");
                return PassReport::new(PassOutcome::BindFailed);
            }
        }

        if self.buffer.is_empty() {
            return PassReport::new(PassOutcome::Empty);
        }

        debug!(
            queue = %self.endpoint,
            pending = self.buffer.size(),
            "Starting reconciliation pass"
        );

        let mut report = PassReport::new(PassOutcome::Drained);
        let mut retry_state = RetryState::new();
        let mut scan = self.buffer.scan();

        loop {
            if shutdown.as_ref().is_some_and(|signal| signal.is_triggered()) {
                report.outcome = PassOutcome::ShutdownRequested;
                break;
            }

            let position = scan.position();
            self.state = ReconcileState::Scanning { position };

            let Some(entry) = scan.current() else {
                break;
            };
            let message_id = entry.message_id().clone();
            debug!(message_id = %message_id, position = position, "Processing message");

            match entry.message().acknowledge().await {
                Ok(()) => {
                    self.state = ReconcileState::AckOk { position };
                    if scan.remove_current() {
                        report.acknowledged += 1;
                        debug!(message_id = %message_id, "Acknowledged message");
                    }
                }
                Err(failure) => {
                    self.state = ReconcileState::AckFail { position };
                    report.ack_failures += 1;
                    warn!(
                        message_id = %message_id,
                        position = position,
                        error = %failure,
                        "Acknowledgment failed; rebinding receiver"
                    );

                    if !retry_state.can_rebind(self.config.max_rebinds_per_pass) {
                        report.outcome = PassOutcome::RebindLimitReached;
                        break;
                    }

                    let delay = retry_state.next_delay(&self.config.rebind_backoff);
                    if delay > Duration::ZERO {
                        debug!(delay_ms = delay.as_millis() as u64, "Backing off before rebind");
                        let interrupted = match shutdown.as_deref_mut() {
                            Some(signal) => tokio::select! {
                                _ = tokio::time::sleep(delay) => false,
                                _ = signal.triggered() => true,
                            },
                            None => {
                                tokio::time::sleep(delay).await;
                                false
                            }
                        };
                        if interrupted {
                            report.outcome = PassOutcome::ShutdownRequested;
                            break;
                        }
                    }

                    retry_state.record_rebind();
                    report.rebinds = retry_state.rebinds;

                    if let Err(e) = self.bind().await {
                        error!(queue = %self.endpoint, error = %e, "Rebind failed");
                        report.outcome = PassOutcome::BindFailed;
                        break;
                    }

                    scan.restart();
                }
            }
        }

        report
    }

    /// Close the active receiver and report how many entries are abandoned
    ///
    /// Abandoned entries were never acknowledged, so the broker redelivers
    /// them to the next consumer that binds.
    pub async fn shutdown(&mut self) -> usize {
        self.close_receiver().await;
        self.state = ReconcileState::Done;

        let abandoned = self.buffer.size();
        if abandoned > 0 {
            warn!(
                queue = %self.endpoint,
                abandoned = abandoned,
                "Abandoning unacknowledged messages to broker redelivery"
            );
        }
        abandoned
    }
}
