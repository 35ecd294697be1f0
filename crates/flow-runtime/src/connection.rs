//! Transport seams: the long-lived connection and the receivers bound on it.

use crate::delivery::DeliverySink;
use crate::error::{BindError, ReceiverError};
use crate::message::{BindingId, QueueEndpoint};
use async_trait::async_trait;

/// Long-lived transport session shared by every receiver
#[async_trait]
pub trait Connection: Send + Sync {
    /// Bind a new receiver to `endpoint`; deliveries go to `sink` once started
    async fn bind(
        &self,
        endpoint: &QueueEndpoint,
        sink: DeliverySink,
    ) -> Result<Box<dyn Receiver>, BindError>;

    /// Check whether the session is currently usable
    fn is_connected(&self) -> bool;

    /// Tear down the session
    async fn disconnect(&self);
}

/// One binding of a consumer to a queue
///
/// A closed receiver is permanently unusable; rebinding always goes through
/// [`Connection::bind`].
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Begin delivering to the sink; repeated calls on an open handle are no-ops
    async fn start(&self) -> Result<(), ReceiverError>;

    /// Release the binding; unacknowledged messages return to the broker
    ///
    /// Closing an already-closed receiver does nothing.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn binding_id(&self) -> &BindingId;

    fn endpoint(&self) -> &QueueEndpoint;
}
