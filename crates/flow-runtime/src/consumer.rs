//! Wiring of buffer, intake and reconciler into a running consumer.

use crate::buffer::PendingBuffer;
use crate::config::ConsumerConfig;
use crate::connection::Connection;
use crate::delivery::{delivery_channel, spawn_intake};
use crate::error::FlowError;
use crate::message::QueueEndpoint;
use crate::reconciler::Reconciler;
use crate::schedule::{spawn_reconciler, ReconcileSchedule, ShutdownSummary};
use crate::shutdown::{shutdown_channel, ShutdownTrigger};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// A started consumer: intake and reconciliation tasks running on tokio
pub struct FlowConsumer {
    endpoint: QueueEndpoint,
    buffer: PendingBuffer,
    trigger: ShutdownTrigger,
    intake: JoinHandle<usize>,
    reconciler: JoinHandle<ShutdownSummary>,
}

impl FlowConsumer {
    /// Bind the initial receiver and start the background tasks
    ///
    /// The connection is shared and outlives the consumer; disconnecting it
    /// is left to the caller.
    pub async fn start(
        connection: Arc<dyn Connection>,
        config: &ConsumerConfig,
    ) -> Result<Self, FlowError> {
        config.validate()?;
        let endpoint = config.queue.endpoint()?;

        let buffer = PendingBuffer::new();
        let (sink, intake) = delivery_channel(buffer.clone());
        let (trigger, signal) = shutdown_channel();

        let mut reconciler = Reconciler::new(
            connection,
            endpoint.clone(),
            buffer.clone(),
            sink,
            config.reconcile.clone(),
        );
        reconciler.bind().await?;

        let intake = spawn_intake(intake, signal.clone());
        let reconciler =
            spawn_reconciler(reconciler, ReconcileSchedule::from(&config.schedule), signal);

        info!(queue = %endpoint, "Consumer started");

        Ok(Self {
            endpoint,
            buffer,
            trigger,
            intake,
            reconciler,
        })
    }

    pub fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }

    /// Number of delivered messages not yet acknowledged
    pub fn pending(&self) -> usize {
        self.buffer.size()
    }

    pub fn buffer(&self) -> &PendingBuffer {
        &self.buffer
    }

    /// Stop both tasks and report what the reconciler did
    pub async fn shutdown(self) -> ShutdownSummary {
        self.trigger.trigger();

        let summary = match self.reconciler.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(queue = %self.endpoint, error = %e, "Reconciliation task failed");
                ShutdownSummary {
                    abandoned: self.buffer.size(),
                    ..Default::default()
                }
            }
        };

        match self.intake.await {
            Ok(buffered) => info!(
                queue = %self.endpoint,
                buffered = buffered,
                "Intake stopped"
            ),
            Err(e) => error!(queue = %self.endpoint, error = %e, "Intake task failed"),
        }

        summary
    }
}
