//! Delivery path from the transport into the pending buffer.
//!
//! Transports never touch the buffer directly. They push every delivered
//! message into a [`DeliverySink`], which is the sending half of an unbounded
//! channel; the [`Intake`] task on the other end appends to the
//! [`PendingBuffer`]. This keeps transport threading out of the buffer's
//! locking discipline and makes the delivery callback non-blocking.

use crate::buffer::PendingBuffer;
use crate::error::CallbackError;
use crate::message::{BindingId, InboundMessage};
use crate::shutdown::ShutdownSignal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;

struct Delivery {
    binding_id: BindingId,
    message: InboundMessage,
}

/// Create the sink handed to receivers and the intake that feeds `buffer`
pub fn delivery_channel(buffer: PendingBuffer) -> (DeliverySink, Intake) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliverySink { tx }, Intake { rx, buffer })
}

/// Delivery callback registered with a receiver
#[derive(Clone)]
pub struct DeliverySink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl DeliverySink {
    /// Hand a delivered message to the intake
    ///
    /// Never blocks and never fails the caller: if the intake is gone the
    /// message is dropped and logged, and the broker redelivers it after the
    /// next rebind because it was never acknowledged.
    pub fn deliver(&self, binding_id: &BindingId, message: InboundMessage) {
        if let Err(error) = self.try_deliver(binding_id, message) {
            warn!(error = %error, "Dropping delivered message");
        }
    }

    pub fn try_deliver(
        &self,
        binding_id: &BindingId,
        message: InboundMessage,
    ) -> Result<(), CallbackError> {
        self.tx
            .send(Delivery {
                binding_id: binding_id.clone(),
                message,
            })
            .map_err(|rejected| CallbackError::IntakeClosed {
                binding_id: rejected.0.binding_id,
                message_id: rejected.0.message.message_id().clone(),
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for DeliverySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverySink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving end of the delivery channel
pub struct Intake {
    rx: mpsc::UnboundedReceiver<Delivery>,
    buffer: PendingBuffer,
}

impl Intake {
    fn accept(&self, delivery: Delivery) {
        let message_id = delivery.message.message_id().clone();
        let redelivered = delivery.message.is_redelivered();
        let entry = self.buffer.append(delivery.message);
        debug!(
            message_id = %message_id,
            binding_id = %delivery.binding_id,
            entry = entry.value(),
            redelivered = redelivered,
            "Buffered delivered message"
        );
    }

    /// Move every delivery already queued into the buffer without waiting
    pub fn drain_ready(&mut self) -> usize {
        let mut moved = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            self.accept(delivery);
            moved += 1;
        }
        moved
    }

    /// Append deliveries until shutdown or until every sink is dropped
    ///
    /// Returns the number of messages buffered.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> usize {
        let mut buffered = 0;
        loop {
            tokio::select! {
                delivery = self.rx.recv() => match delivery {
                    Some(delivery) => {
                        self.accept(delivery);
                        buffered += 1;
                    }
                    None => {
                        debug!("All delivery sinks dropped; intake stopping");
                        break;
                    }
                },
                _ = shutdown.triggered() => {
                    info!(buffered = buffered, "Intake stopping on shutdown");
                    break;
                }
            }
        }
        buffered
    }
}

/// Run the intake on its own task
pub fn spawn_intake(intake: Intake, shutdown: ShutdownSignal) -> JoinHandle<usize> {
    tokio::spawn(intake.run(shutdown))
}
