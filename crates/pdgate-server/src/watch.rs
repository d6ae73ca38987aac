//! Operator watch registry.
//!
//! Process-wide map from `(store_id, subscriber_id)` to the queue feeding
//! one heartbeat stream's pusher. Publishers address a store (through the
//! region leader) or one subscriber directly; every queued instruction
//! carries an ack slot the pusher resolves once the write outcome is known.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pdgate_state::{RegionInfo, StoreId};

use crate::proto;

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub store_id: StoreId,
    pub subscriber_id: u64,
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store_id, self.subscriber_id)
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("subscriber {0} is already registered")]
    Duplicate(SubscriberKey),
}

/// Why an instruction did not reach its stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("stream write failed: {0}")]
    WriteFailed(String),
    #[error("subscription dropped before delivery")]
    Dropped,
}

pub type DeliveryResult = Result<(), DeliveryError>;

/// One queued instruction and the slot its outcome is reported through.
#[derive(Debug)]
pub struct OperatorRequest {
    pub response: proto::RegionHeartbeatResponse,
    ack: oneshot::Sender<DeliveryResult>,
}

impl OperatorRequest {
    fn new(response: proto::RegionHeartbeatResponse) -> (Self, Ack) {
        let (tx, rx) = oneshot::channel();
        (Self { response, ack: tx }, Ack(rx))
    }

    /// Split into the payload and its ack slot.
    pub fn into_parts(self) -> (proto::RegionHeartbeatResponse, AckSlot) {
        (self.response, AckSlot(self.ack))
    }
}

/// Producer side of an ack.
#[derive(Debug)]
pub struct AckSlot(oneshot::Sender<DeliveryResult>);

impl AckSlot {
    pub fn report(self, result: DeliveryResult) {
        // The publisher may have stopped waiting.
        let _ = self.0.send(result);
    }
}

/// Publisher side of an ack.
#[derive(Debug)]
pub struct Ack(oneshot::Receiver<DeliveryResult>);

impl Ack {
    /// Wait for the write outcome. An instruction dropped unprocessed
    /// (stream torn down) reports [`DeliveryError::Dropped`].
    pub async fn wait(self) -> DeliveryResult {
        self.0.await.unwrap_or(Err(DeliveryError::Dropped))
    }
}

type Subscribers = HashMap<SubscriberKey, mpsc::Sender<OperatorRequest>>;

/// Shared registry of operator subscriptions.
#[derive(Clone)]
pub struct WatchRegistry {
    subscribers: Arc<Mutex<Subscribers>>,
    capacity: usize,
}

impl WatchRegistry {
    /// Create a registry whose subscriptions queue up to `capacity`
    /// instructions each.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscription. Fails if the key is taken.
    pub fn subscribe(
        &self,
        store_id: StoreId,
        subscriber_id: u64,
    ) -> Result<Subscription, WatchError> {
        let key = SubscriberKey {
            store_id,
            subscriber_id,
        };
        let mut subscribers = self.lock();
        if subscribers.contains_key(&key) {
            return Err(WatchError::Duplicate(key));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        subscribers.insert(key, tx);
        debug!(%key, "operator subscription registered");
        Ok(Subscription {
            key,
            rx,
            registry: self.clone(),
        })
    }

    fn unsubscribe(&self, key: &SubscriberKey) {
        if self.lock().remove(key).is_some() {
            debug!(%key, "operator subscription released");
        }
    }

    /// Deliver an instruction to every subscriber of the region leader's
    /// store.
    ///
    /// Only `origin`, the publishing stream's own subscription, is waited
    /// on: its ack is returned when it is among the targets. Every other
    /// subscriber gets the instruction only if its queue has room, so a
    /// stalled stream never holds up the publisher.
    pub async fn publish(
        &self,
        region: &RegionInfo,
        response: proto::RegionHeartbeatResponse,
        origin: &SubscriberKey,
        scope: &CancellationToken,
    ) -> Option<Ack> {
        let Some(store_id) = region.leader_store_id() else {
            debug!(region_id = region.id(), "instruction for leaderless region dropped");
            return None;
        };
        let targets: Vec<_> = self
            .lock()
            .iter()
            .filter(|(key, _)| key.store_id == store_id)
            .map(|(key, tx)| (*key, tx.clone()))
            .collect();
        if targets.is_empty() {
            debug!(store_id, region_id = region.id(), "no subscriber for instruction");
        }

        let mut own = None;
        for (key, tx) in targets {
            let (request, ack) = OperatorRequest::new(response.clone());
            if key == *origin {
                enqueue(&tx, request, scope).await;
                own = Some(ack);
            } else if tx.try_send(request).is_err() {
                debug!(%key, region_id = region.id(), "subscriber queue full, instruction dropped");
            }
        }
        own
    }

    /// Deliver an instruction to one subscriber, waiting for queue room
    /// unless `scope` ends first.
    pub async fn send_to(
        &self,
        key: &SubscriberKey,
        response: proto::RegionHeartbeatResponse,
        scope: &CancellationToken,
    ) -> Option<Ack> {
        let tx = self.lock().get(key).cloned()?;
        let (request, ack) = OperatorRequest::new(response);
        enqueue(&tx, request, scope).await;
        Some(ack)
    }

    /// Number of live subscriptions for a store.
    pub fn subscriber_count(&self, store_id: StoreId) -> usize {
        self.lock()
            .keys()
            .filter(|key| key.store_id == store_id)
            .count()
    }
}

/// A request that is never queued is dropped, which resolves its ack as
/// [`DeliveryError::Dropped`].
async fn enqueue(
    tx: &mpsc::Sender<OperatorRequest>,
    request: OperatorRequest,
    scope: &CancellationToken,
) {
    tokio::select! {
        _ = scope.cancelled() => {}
        _ = tx.send(request) => {}
    }
}

/// A registered subscription. Unregisters itself on drop.
pub struct Subscription {
    key: SubscriberKey,
    rx: mpsc::Receiver<OperatorRequest>,
    registry: WatchRegistry,
}

impl Subscription {
    pub fn key(&self) -> SubscriberKey {
        self.key
    }

    /// Next instruction, in publish order. `None` once the registry side
    /// has been closed.
    pub async fn recv(&mut self) -> Option<OperatorRequest> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.key);
    }
}
