//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Holds durable (provisioned) and temporary (created on bind) queues
//! - Allows one exclusive binding per queue
//! - Uses client acknowledgment: delivered messages stay in flight until
//!   acknowledged, and return to the head of the queue when their binding
//!   closes, marked as redelivered
//! - Injects acknowledgment failures on demand through [`AckFaults`]
//!
//! It is intended for:
//! - Unit and integration testing of the consumption engine
//! - Running the consumer binary without a real broker

use crate::config::ConnectionSettings;
use crate::connection::{Connection, Receiver};
use crate::delivery::DeliverySink;
use crate::error::{AckFailure, BindError, ConnectError, FlowError, ReceiverError};
use crate::message::{
    Acknowledger, BindingId, Durability, InboundMessage, MessageId, QueueEndpoint, QueueName,
};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Fault Injection
// ============================================================================

/// Broker verdicts for acknowledgments, used to simulate failures
#[derive(Debug, Clone, Default)]
pub enum AckFaults {
    /// Every acknowledgment succeeds
    #[default]
    None,
    /// Outcomes consumed in order (`true` = success); success once exhausted
    Scripted(VecDeque<bool>),
    /// Each acknowledgment independently fails with this probability
    Random { failure_rate: f64 },
}

impl AckFaults {
    pub fn scripted(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self::Scripted(outcomes.into_iter().collect())
    }

    fn next_succeeds(&mut self) -> bool {
        match self {
            Self::None => true,
            Self::Scripted(outcomes) => outcomes.pop_front().unwrap_or(true),
            Self::Random { failure_rate } => {
                !rand::thread_rng().gen_bool(failure_rate.clamp(0.0, 1.0))
            }
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    attributes: HashMap<String, String>,
    delivery_count: u32,
}

struct BrokerQueue {
    durability: Durability,
    /// Waiting for delivery, head first
    ready: VecDeque<StoredMessage>,
    /// Delivered and awaiting acknowledgment, in delivery order
    in_flight: Vec<(StoredMessage, BindingId)>,
    active_binding: Option<BindingId>,
    acknowledged: u64,
    redelivered: u64,
}

impl BrokerQueue {
    fn new(durability: Durability) -> Self {
        Self {
            durability,
            ready: VecDeque::new(),
            in_flight: Vec::new(),
            active_binding: None,
            acknowledged: 0,
            redelivered: 0,
        }
    }

    fn holds(&self, message_id: &MessageId) -> bool {
        self.in_flight
            .iter()
            .any(|(message, _)| &message.message_id == message_id)
            || self.ready.iter().any(|message| &message.message_id == message_id)
    }

    /// Settle a message wherever it currently is
    fn settle(&mut self, message_id: &MessageId) -> bool {
        if let Some(index) = self
            .in_flight
            .iter()
            .position(|(message, _)| &message.message_id == message_id)
        {
            self.in_flight.remove(index);
        } else if let Some(index) = self
            .ready
            .iter()
            .position(|message| &message.message_id == message_id)
        {
            self.ready.remove(index);
        } else {
            return false;
        }
        self.acknowledged += 1;
        true
    }

    /// Put a binding's in-flight messages back at the head, keeping their order
    fn release_binding(&mut self, binding_id: &BindingId) -> usize {
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|(_, owner)| owner == binding_id);
        self.in_flight = kept;

        let count = released.len();
        for (message, _) in released.into_iter().rev() {
            self.ready.push_front(message);
        }
        if self.active_binding.as_ref() == Some(binding_id) {
            self.active_binding = None;
        }
        count
    }
}

struct BindingState {
    queue: QueueName,
    connection_id: u64,
    sink: DeliverySink,
    started: bool,
}

struct BrokerState {
    online: bool,
    users: HashMap<String, Option<String>>,
    queues: HashMap<QueueName, BrokerQueue>,
    bindings: HashMap<BindingId, BindingState>,
    ack_faults: AckFaults,
    next_connection_id: u64,
}

impl BrokerState {
    fn close_binding(&mut self, binding_id: &BindingId) -> bool {
        let Some(binding) = self.bindings.remove(binding_id) else {
            return false;
        };

        if let Some(queue) = self.queues.get_mut(&binding.queue) {
            let released = queue.release_binding(binding_id);
            debug!(
                binding_id = %binding_id,
                queue = %binding.queue,
                released = released,
                "Binding closed; in-flight messages queued for redelivery"
            );
        }
        true
    }

    /// Push every ready message of `queue_name` to its started binding
    fn deliver_ready(&mut self, queue_name: &QueueName, handle: &SharedState) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(binding_id) = queue.active_binding.clone() else {
            return;
        };
        let Some(binding) = self.bindings.get(&binding_id) else {
            return;
        };
        if !binding.started {
            return;
        }

        while let Some(mut message) = queue.ready.pop_front() {
            message.delivery_count += 1;
            if message.delivery_count > 1 {
                queue.redelivered += 1;
            }

            let inbound = InboundMessage::new(
                message.message_id.clone(),
                message.body.clone(),
                Arc::new(InMemoryAcknowledger {
                    state: handle.clone(),
                    queue: queue_name.clone(),
                }),
            )
            .with_delivery_count(message.delivery_count)
            .with_attributes(message.attributes.clone());

            queue.in_flight.push((message, binding_id.clone()));
            binding.sink.deliver(&binding_id, inbound);
        }
    }
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Acknowledgment
// ============================================================================

/// Settles messages of one queue on the shared broker state
struct InMemoryAcknowledger {
    state: SharedState,
    queue: QueueName,
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn acknowledge(&self, message_id: &MessageId) -> Result<(), AckFailure> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        if !state.online {
            return Err(AckFailure::TransportUnavailable {
                message_id: message_id.clone(),
            });
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(AckFailure::Rejected {
                message_id: message_id.clone(),
                reason: format!("queue '{}' no longer exists", self.queue),
            });
        };

        // Acknowledging an already-settled id is a no-op, so duplicates
        // produced by redelivery can each be acknowledged. Injected faults
        // only apply to messages the broker still holds.
        if !queue.holds(message_id) {
            debug!(message_id = %message_id, "Message already settled");
            return Ok(());
        }

        if !state.ack_faults.next_succeeds() {
            return Err(AckFailure::Rejected {
                message_id: message_id.clone(),
                reason: "injected acknowledgment failure".to_string(),
            });
        }

        queue.settle(message_id);
        Ok(())
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Per-queue counters exposed for tests and the demo binary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub acknowledged: u64,
    pub redelivered: u64,
}

/// Process-local broker shared by every connection created from it
#[derive(Clone)]
pub struct InMemoryBroker {
    state: SharedState,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an online broker with no queues and open access
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                users: HashMap::new(),
                queues: HashMap::new(),
                bindings: HashMap::new(),
                ack_faults: AckFaults::None,
                next_connection_id: 1,
            })),
        }
    }

    /// Require credentials; once any user is registered, unknown users are refused
    pub fn with_user(self, username: impl Into<String>, password: Option<String>) -> Self {
        lock(&self.state).users.insert(username.into(), password);
        self
    }

    /// Create a durable queue. Returns `false` if the queue already existed.
    pub fn provision_queue(&self, name: QueueName) -> bool {
        let mut state = lock(&self.state);
        if state.queues.contains_key(&name) {
            return false;
        }
        info!(queue = %name, "Provisioned durable queue");
        state
            .queues
            .insert(name, BrokerQueue::new(Durability::Durable));
        true
    }

    /// Enqueue a message, delivering it at once if the queue has a started binding
    pub fn publish(&self, queue: &QueueName, body: impl Into<Bytes>) -> Result<MessageId, FlowError> {
        self.publish_with_attributes(queue, body, HashMap::new())
    }

    pub fn publish_with_attributes(
        &self,
        queue: &QueueName,
        body: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> Result<MessageId, FlowError> {
        let mut state = lock(&self.state);
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(FlowError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        };

        let message_id = MessageId::new();
        target.ready.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            attributes,
            delivery_count: 0,
        });

        state.deliver_ready(queue, &self.state);
        Ok(message_id)
    }

    /// Replace the acknowledgment verdicts
    pub fn set_ack_faults(&self, faults: AckFaults) {
        lock(&self.state).ack_faults = faults;
    }

    /// Take the broker offline or back online
    ///
    /// Going offline drops every binding, returning in-flight messages to
    /// their queues; binds and acknowledgments fail until it comes back.
    pub fn set_online(&self, online: bool) {
        let mut state = lock(&self.state);
        if state.online == online {
            return;
        }
        state.online = online;

        if online {
            info!("Broker back online");
            return;
        }

        let binding_ids: Vec<BindingId> = state.bindings.keys().cloned().collect();
        for binding_id in &binding_ids {
            state.close_binding(binding_id);
        }
        warn!(dropped_bindings = binding_ids.len(), "Broker went offline");
    }

    pub fn is_online(&self) -> bool {
        lock(&self.state).online
    }

    pub fn stats(&self, queue: &QueueName) -> Option<QueueStats> {
        lock(&self.state).queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            in_flight: q.in_flight.len(),
            acknowledged: q.acknowledged,
            redelivered: q.redelivered,
        })
    }

    pub fn has_queue(&self, queue: &QueueName) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Open a session against this broker
    pub fn connect(&self, settings: &ConnectionSettings) -> Result<InMemoryConnection, ConnectError> {
        settings
            .validate()
            .map_err(|e| ConnectError::InvalidProperties {
                message: e.to_string(),
            })?;

        let mut state = lock(&self.state);
        if !state.online {
            return Err(ConnectError::Unreachable {
                host: settings.host.clone(),
                message: "broker is offline".to_string(),
            });
        }

        if !state.users.is_empty() {
            let accepted = matches!(
                state.users.get(&settings.username),
                Some(expected) if expected == &settings.password
            );
            if !accepted {
                return Err(ConnectError::AuthenticationFailed {
                    username: settings.username.clone(),
                });
            }
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;

        info!(
            connection_id = id,
            host = %settings.host,
            username = %settings.username,
            "Connected to in-memory broker"
        );

        Ok(InMemoryConnection {
            id,
            state: self.state.clone(),
            disconnected: AtomicBool::new(false),
            temporary_queues: Mutex::new(Vec::new()),
        })
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Session on an [`InMemoryBroker`]
pub struct InMemoryConnection {
    id: u64,
    state: SharedState,
    disconnected: AtomicBool,
    /// Temporary queues created by this session, deleted on disconnect
    temporary_queues: Mutex<Vec<QueueName>>,
}

impl std::fmt::Debug for InMemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnection")
            .field("id", &self.id)
            .field("disconnected", &self.disconnected.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn bind(
        &self,
        endpoint: &QueueEndpoint,
        sink: DeliverySink,
    ) -> Result<Box<dyn Receiver>, BindError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BindError::ConnectionUnavailable {
                message: "connection has been disconnected".to_string(),
            });
        }

        let mut state = lock(&self.state);
        if !state.online {
            return Err(BindError::ConnectionUnavailable {
                message: "broker is offline".to_string(),
            });
        }

        if !state.queues.contains_key(&endpoint.name) {
            if endpoint.is_durable() {
                return Err(BindError::QueueNotFound {
                    queue_name: endpoint.name.to_string(),
                });
            }
            self.temporary_queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(endpoint.name.clone());
            state.queues.insert(
                endpoint.name.clone(),
                BrokerQueue::new(Durability::Temporary),
            );
            debug!(queue = %endpoint.name, "Created temporary queue");
        }

        let Some(queue) = state.queues.get_mut(&endpoint.name) else {
            return Err(BindError::QueueNotFound {
                queue_name: endpoint.name.to_string(),
            });
        };

        if let Some(active) = &queue.active_binding {
            return Err(BindError::ExclusiveBindingActive {
                queue_name: endpoint.name.to_string(),
                binding_id: active.clone(),
            });
        }

        let binding_id = BindingId::new();
        queue.active_binding = Some(binding_id.clone());
        state.bindings.insert(
            binding_id.clone(),
            BindingState {
                queue: endpoint.name.clone(),
                connection_id: self.id,
                sink,
                started: false,
            },
        );

        debug!(queue = %endpoint, binding_id = %binding_id, "Bound receiver");

        Ok(Box::new(InMemoryReceiver {
            binding_id,
            endpoint: endpoint.clone(),
            state: self.state.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst) && lock(&self.state).online
    }

    async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = lock(&self.state);
        let owned: Vec<BindingId> = state
            .bindings
            .iter()
            .filter(|(_, binding)| binding.connection_id == self.id)
            .map(|(id, _)| id.clone())
            .collect();
        for binding_id in &owned {
            state.close_binding(binding_id);
        }

        let temporary = std::mem::take(
            &mut *self
                .temporary_queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for name in &temporary {
            let is_temporary = state
                .queues
                .get(name)
                .is_some_and(|queue| queue.durability == Durability::Temporary);
            if is_temporary {
                state.queues.remove(name);
            }
        }

        info!(
            connection_id = self.id,
            closed_bindings = owned.len(),
            deleted_queues = temporary.len(),
            "Disconnected from in-memory broker"
        );
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Exclusive binding on one queue; delivers nothing until started
pub struct InMemoryReceiver {
    binding_id: BindingId,
    endpoint: QueueEndpoint,
    state: SharedState,
}

#[async_trait]
impl Receiver for InMemoryReceiver {
    async fn start(&self) -> Result<(), ReceiverError> {
        let mut state = lock(&self.state);
        let Some(binding) = state.bindings.get_mut(&self.binding_id) else {
            return Err(ReceiverError::Closed {
                binding_id: self.binding_id.clone(),
            });
        };
        binding.started = true;
        let queue = binding.queue.clone();

        state.deliver_ready(&queue, &self.state);
        Ok(())
    }

    async fn close(&self) {
        if lock(&self.state).close_binding(&self.binding_id) {
            debug!(binding_id = %self.binding_id, "Receiver closed");
        }
    }

    fn is_closed(&self) -> bool {
        !lock(&self.state).bindings.contains_key(&self.binding_id)
    }

    fn binding_id(&self) -> &BindingId {
        &self.binding_id
    }

    fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }
}
