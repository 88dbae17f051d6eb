//! Broadcast hub for live subscriber connections.
//!
//! Change events fan out to every connection (the shared board is a
//! legitimate viewer of any record); notification events only to the
//! connections of their recipient. Each connection gets one ordered bounded
//! channel written with `try_send`: a full or closed channel evicts that
//! connection and never stalls delivery to the others. A bounded lookback
//! ring of recent change events serves reconnection replay; anything older
//! requires a full resynchronization fetch, which the subscription signals.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use caseflow_core::{ActorId, ChangeEvent, Frame, NotificationEvent};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus registry lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusLimits {
    /// Outbound frames buffered per connection before it is evicted as slow.
    pub connection_queue_depth: usize,
    /// Change events retained for reconnection replay.
    pub lookback_events: usize,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self { connection_queue_depth: 256, lookback_events: 512 }
    }
}

/// Handle returned to a subscriber. Dropping the receiver is equivalent to
/// an unclean disconnect; the connection is evicted on its next send.
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub receiver: Receiver<Frame>,
    /// Set when `last_seen` predates the lookback ring, meaning replay could
    /// not cover the gap and the client must do a full list fetch.
    pub resync_required: bool,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (connections, latest_seq) = self
            .inner
            .lock()
            .map(|state| (state.connections.len(), state.next_event_seq))
            .unwrap_or((0, 0));
        f.debug_struct("EventBus")
            .field("connections", &connections)
            .field("latest_seq", &latest_seq)
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new(limits: BusLimits) -> Self {
        Self { inner: Arc::new(Mutex::new(BusState::new(limits))) }
    }

    /// Register a live connection for `recipient_id`.
    ///
    /// `last_seen` is the highest change-event sequence the client observed
    /// before disconnecting; every retained event after it is replayed into
    /// the fresh channel before this call returns, so replay precedes any
    /// concurrently published event on the same connection.
    ///
    /// # Errors
    /// Returns `LockPoisoned` when the registry mutex is poisoned.
    pub fn subscribe(
        &self,
        recipient_id: ActorId,
        last_seen: Option<u64>,
    ) -> Result<Subscription, BusError> {
        let mut state = self.lock_state()?;

        let (sender, receiver) = mpsc::channel(state.limits.connection_queue_depth);
        let connection_id = ConnectionId(state.next_connection_id);
        state.next_connection_id += 1;

        let mut resync_required = false;
        if let Some(last_seen) = last_seen {
            let ring_start = state.ring.front().map(|(seq, _)| *seq);
            match ring_start {
                // Ring covers the gap only if nothing between last_seen and
                // the oldest retained event has been evicted.
                Some(start) if last_seen + 1 >= start => {
                    for (seq, change) in &state.ring {
                        if *seq > last_seen {
                            let frame = Frame::RecordChanged { seq: *seq, change: change.clone() };
                            if sender.try_send(frame).is_err() {
                                resync_required = true;
                                break;
                            }
                        }
                    }
                }
                Some(_) => resync_required = true,
                // Empty ring: recoverable only if no event was ever evicted.
                None => resync_required = last_seen < state.evicted_through,
            }
        }

        state.connections.insert(connection_id, Connection { recipient_id, sender });
        tracing::debug!(connection = connection_id.0, recipient = %recipient_id, resync_required, "connection subscribed");

        Ok(Subscription { connection_id, receiver, resync_required })
    }

    /// Remove a connection explicitly (clean disconnect).
    ///
    /// # Errors
    /// Returns `LockPoisoned` when the registry mutex is poisoned.
    pub fn unsubscribe(&self, connection_id: ConnectionId) -> Result<(), BusError> {
        let mut state = self.lock_state()?;
        state.connections.remove(&connection_id);
        Ok(())
    }

    /// Fan a change event out to every live connection and retain it in the
    /// lookback ring. Returns the sequence assigned to the event.
    ///
    /// # Errors
    /// Returns `LockPoisoned` when the registry mutex is poisoned.
    pub fn publish(&self, change: &ChangeEvent) -> Result<u64, BusError> {
        let mut state = self.lock_state()?;

        state.next_event_seq += 1;
        let seq = state.next_event_seq;
        state.push_ring(seq, change.clone());

        let mut evicted = Vec::new();
        for (id, connection) in &state.connections {
            let frame = Frame::RecordChanged { seq, change: change.clone() };
            if let Err(reason) = try_deliver(connection, frame) {
                tracing::warn!(connection = id.0, reason, "evicting connection on change fan-out");
                evicted.push(*id);
            }
        }
        for id in evicted {
            state.connections.remove(&id);
        }

        Ok(seq)
    }

    /// Deliver a notification to every connection of its recipient only.
    ///
    /// # Errors
    /// Returns `LockPoisoned` when the registry mutex is poisoned.
    pub fn publish_notification(&self, notification: &NotificationEvent) -> Result<(), BusError> {
        let mut state = self.lock_state()?;

        let mut evicted = Vec::new();
        for (id, connection) in &state.connections {
            if connection.recipient_id != notification.recipient_id {
                continue;
            }
            let frame = Frame::Notification(notification.clone());
            if let Err(reason) = try_deliver(connection, frame) {
                tracing::warn!(connection = id.0, reason, "evicting connection on notification fan-out");
                evicted.push(*id);
            }
        }
        for id in evicted {
            state.connections.remove(&id);
        }

        Ok(())
    }

    /// # Errors
    /// Returns `LockPoisoned` when the registry mutex is poisoned.
    pub fn connection_count(&self) -> Result<usize, BusError> {
        Ok(self.lock_state()?.connections.len())
    }

    /// Highest change-event sequence assigned so far.
    ///
    /// # Errors
    /// Returns `LockPoisoned` when the registry mutex is poisoned.
    pub fn latest_seq(&self) -> Result<u64, BusError> {
        Ok(self.lock_state()?.next_event_seq)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.inner.lock().map_err(|_| BusError::LockPoisoned)
    }
}

fn try_deliver(connection: &Connection, frame: Frame) -> Result<(), &'static str> {
    match connection.sender.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err("outbound queue full"),
        Err(TrySendError::Closed(_)) => Err("receiver dropped"),
    }
}

struct Connection {
    recipient_id: ActorId,
    sender: Sender<Frame>,
}

struct BusState {
    limits: BusLimits,
    next_connection_id: u64,
    next_event_seq: u64,
    /// Sequence of the newest event ever evicted from the ring; replay below
    /// this point is unrecoverable through the bus.
    evicted_through: u64,
    ring: VecDeque<(u64, ChangeEvent)>,
    connections: BTreeMap<ConnectionId, Connection>,
}

impl BusState {
    fn new(limits: BusLimits) -> Self {
        Self {
            limits,
            next_connection_id: 1,
            next_event_seq: 0,
            evicted_through: 0,
            ring: VecDeque::new(),
            connections: BTreeMap::new(),
        }
    }

    fn push_ring(&mut self, seq: u64, change: ChangeEvent) {
        self.ring.push_back((seq, change));
        while self.ring.len() > self.limits.lookback_events {
            if let Some((evicted_seq, _)) = self.ring.pop_front() {
                self.evicted_through = evicted_seq;
            }
        }
    }
}
