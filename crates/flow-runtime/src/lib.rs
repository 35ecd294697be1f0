//! # Flow Runtime
//!
//! At-least-once consumption engine for durable message queues.
//!
//! Messages delivered by a transport are appended to a [`PendingBuffer`]. A
//! [`Reconciler`], driven on a fixed schedule, walks the buffer and
//! acknowledges each message. When an acknowledgment fails it tears down the
//! receiver, binds a fresh one (which makes the broker redeliver everything
//! unacknowledged) and restarts the scan from the head of the buffer.
//!
//! ## Module Organization
//!
//! - [`buffer`] - Pending buffer and its restartable scan cursor
//! - [`delivery`] - Delivery sink handed to receivers and the intake task
//! - [`connection`] - `Connection` and `Receiver` transport seams
//! - [`reconciler`] - Acknowledgment state machine with rebind-and-rescan
//! - [`schedule`] - Fixed-delay scheduling of reconciliation passes
//! - [`consumer`] - Wiring of all of the above into a running consumer
//! - [`providers`] - In-memory broker
//! - [`config`], [`error`], [`message`], [`retry`], [`shutdown`]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod message;
pub mod providers;
pub mod reconciler;
pub mod retry;
pub mod schedule;
pub mod shutdown;

// Re-export commonly used types at crate root for convenience
pub use buffer::{EntryId, PendingBuffer, PendingEntry, Scan};
pub use config::{
    AuthScheme, ConnectionSettings, ConsumerConfig, QueueSettings, ReconcilerConfig,
    ScheduleConfig,
};
pub use connection::{Connection, Receiver};
pub use consumer::FlowConsumer;
pub use delivery::{delivery_channel, spawn_intake, DeliverySink, Intake};
pub use error::{
    AckFailure, BindError, CallbackError, ConfigurationError, ConnectError, FlowError,
    ReceiverError, ValidationError,
};
pub use message::{
    Acknowledger, BindingId, Durability, InboundMessage, MessageId, QueueEndpoint, QueueName,
    Timestamp,
};
pub use providers::{AckFaults, InMemoryBroker, InMemoryConnection, QueueStats};
pub use reconciler::{PassOutcome, PassReport, ReconcileState, Reconciler, ReconcilerStats};
pub use retry::{RetryPolicy, RetryState};
pub use schedule::{run_schedule, spawn_reconciler, ReconcileSchedule, ShutdownSummary};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
