//! Transport implementations.
//!
//! Only the in-memory broker ships with the runtime; real transports plug in
//! through the [`Connection`](crate::connection::Connection) trait.

pub mod memory;

pub use memory::{AckFaults, InMemoryBroker, InMemoryConnection, InMemoryReceiver, QueueStats};
