use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_types::events::{ChangeEvent, ChangeSink, SubscriptionFilter, SubscriptionHandle};
use parley_types::models::UserId;
use parley_types::{ChatError, ChatResult};

pub type ConnectionId = Uuid;

/// One store event routed to one subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionHandle,
    pub event: ChangeEvent,
}

/// Routes store events to the live connections whose filters match.
///
/// Every connection owns a bounded queue. Publishing never waits on a
/// subscriber: when a queue is full its oldest entries are overwritten and the
/// receiver sees the gap as a lag count. Other subscribers are unaffected.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    queue_capacity: usize,
    next_handle: AtomicU64,
    state: RwLock<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Ordered by handle so matching is deterministic.
    subscriptions: BTreeMap<SubscriptionHandle, Subscription>,
}

struct ConnectionEntry {
    user_id: UserId,
    tx: broadcast::Sender<Delivery>,
}

struct Subscription {
    connection: ConnectionId,
    filter: SubscriptionFilter,
}

impl Broker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queue_capacity: queue_capacity.max(1),
                next_handle: AtomicU64::new(1),
                state: RwLock::new(BrokerState::default()),
            }),
        }
    }

    /// Register a live connection for `user_id`. Returns (conn_id, receiver).
    pub fn connect(&self, user_id: UserId) -> (ConnectionId, DeliveryReceiver) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = broadcast::channel(self.inner.queue_capacity);
        self.write_state()
            .connections
            .insert(conn_id, ConnectionEntry { user_id, tx });
        debug!("Broker: connection {} registered for {}", conn_id, user_id);
        (conn_id, DeliveryReceiver { rx, conn_id, dropped: 0 })
    }

    /// Remove a connection and every subscription it holds.
    pub fn disconnect(&self, conn_id: ConnectionId) {
        let mut state = self.write_state();
        if state.connections.remove(&conn_id).is_none() {
            return;
        }
        let before = state.subscriptions.len();
        state.subscriptions.retain(|_, sub| sub.connection != conn_id);
        debug!(
            "Broker: connection {} removed with {} subscriptions",
            conn_id,
            before - state.subscriptions.len()
        );
    }

    pub fn subscribe(&self, conn_id: ConnectionId, filter: SubscriptionFilter) -> ChatResult<SubscriptionHandle> {
        let mut state = self.write_state();
        if !state.connections.contains_key(&conn_id) {
            return Err(ChatError::NotFound(format!("connection {}", conn_id)));
        }
        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        info!("Broker: {} subscribed {} to {:?}", conn_id, handle, filter);
        state.subscriptions.insert(handle, Subscription { connection: conn_id, filter });
        Ok(handle)
    }

    /// Remove a subscription. Unknown handles are a no-op; returns whether one was removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.write_state().subscriptions.remove(&handle).is_some();
        if removed {
            debug!("Broker: {} removed", handle);
        }
        removed
    }

    /// Connection that holds `handle`, if it is still active.
    pub fn owner_of(&self, handle: SubscriptionHandle) -> Option<ConnectionId> {
        self.read_state().subscriptions.get(&handle).map(|s| s.connection)
    }

    pub fn subscriptions_of(&self, conn_id: ConnectionId) -> Vec<(SubscriptionHandle, SubscriptionFilter)> {
        self.read_state()
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.connection == conn_id)
            .map(|(handle, sub)| (*handle, sub.filter.clone()))
            .collect()
    }

    /// Number of live connections of a user.
    pub fn connections_of(&self, user_id: UserId) -> usize {
        self.read_state()
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .count()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, BrokerState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, BrokerState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChangeSink for Broker {
    fn publish(&self, event: ChangeEvent) {
        if let Some(reason) = event.malformed_reason() {
            warn!("Broker: dropping malformed {:?} event: {}", event.source(), reason);
            return;
        }

        let state = self.read_state();
        let mut delivered = 0usize;
        for (handle, sub) in &state.subscriptions {
            if !sub.filter.matches(&event) {
                continue;
            }
            let Some(conn) = state.connections.get(&sub.connection) else {
                continue;
            };
            // Only fails when the receiver is already gone; disconnect cleans up.
            if conn
                .tx
                .send(Delivery {
                    subscription: *handle,
                    event: event.clone(),
                })
                .is_ok()
            {
                delivered += 1;
            }
        }
        drop(state);

        trace!("Broker: {:?} event delivered to {} subscriptions", event.source(), delivered);
    }
}

/// Receiving half of one connection's bounded queue.
pub struct DeliveryReceiver {
    rx: broadcast::Receiver<Delivery>,
    conn_id: ConnectionId,
    dropped: u64,
}

impl DeliveryReceiver {
    /// Next delivery, skipping over anything lost to overflow.
    /// `None` once the connection has been removed from the broker.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(delivery) => return Some(delivery),
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.try_recv() {
                Ok(delivery) => return Some(delivery),
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total deliveries lost to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn note_lag(&mut self, n: u64) {
        warn!("Connection {} lagged, dropped {} oldest deliveries", self.conn_id, n);
        self.dropped += n;
    }
}
