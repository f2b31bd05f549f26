//! WebSocket connection management
//!
//! Represents an agent's live connection with its outbound queue,
//! subscription set and heartbeat bookkeeping.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::events::ServerEvent;
use super::queue::{OutboundQueue, PushOutcome};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Connected with at least one ticket subscription
    Subscribed,
    Disconnected,
}

/// The connection was already torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection is closed")]
pub struct ConnectionClosed;

/// An active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique id for this connection
    pub connection_id: Uuid,

    /// Agent the connection belongs to
    pub user_id: Uuid,

    /// Display name used in typing indicators
    pub user_name: String,

    queue: OutboundQueue,

    /// Ticket ids this connection is subscribed to
    subscriptions: RwLock<HashSet<Uuid>>,

    state: Mutex<ConnectionState>,

    last_seen: Mutex<Instant>,
}

impl Connection {
    pub fn new(user_id: Uuid, user_name: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            user_name: user_name.into(),
            queue: OutboundQueue::new(queue_capacity),
            subscriptions: RwLock::new(HashSet::new()),
            state: Mutex::new(ConnectionState::Connecting),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Queue an event for this connection.
    ///
    /// A full queue evicts its oldest event; only a closed connection fails.
    pub fn send(&self, event: ServerEvent) -> Result<(), ConnectionClosed> {
        let kind = event.kind();
        match self.queue.push(event) {
            PushOutcome::Queued => Ok(()),
            PushOutcome::DroppedOldest => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    user_id = %self.user_id,
                    event_type = kind,
                    dropped_total = self.queue.dropped_total(),
                    "SlowConsumerDrop: outbound queue full, dropped oldest event"
                );
                Ok(())
            }
            PushOutcome::Closed => Err(ConnectionClosed),
        }
    }

    /// Next event for the socket writer; `None` once closed.
    pub async fn recv(&self) -> Option<ServerEvent> {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<ServerEvent> {
        self.queue.try_recv()
    }

    /// Resolves when the hub tears the connection down.
    pub async fn closed(&self) {
        self.queue.closed().await
    }

    pub(crate) fn close(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.queue.close();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ConnectionState::Disconnected {
            *state = next;
        }
    }

    /// Record client activity for the heartbeat monitor.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to a ticket
    pub async fn subscribe(&self, ticket_id: Uuid) {
        let mut subs = self.subscriptions.write().await;
        subs.insert(ticket_id);
        self.set_state(ConnectionState::Subscribed);
        tracing::debug!(
            connection_id = %self.connection_id,
            ticket_id = %ticket_id,
            "Subscribed to ticket"
        );
    }

    /// Unsubscribe from a ticket; returns whether a subscription existed.
    pub async fn unsubscribe(&self, ticket_id: Uuid) -> bool {
        let mut subs = self.subscriptions.write().await;
        let removed = subs.remove(&ticket_id);
        if subs.is_empty() {
            self.set_state(ConnectionState::Connected);
        }
        tracing::debug!(
            connection_id = %self.connection_id,
            ticket_id = %ticket_id,
            removed,
            "Unsubscribed from ticket"
        );
        removed
    }

    /// Check if subscribed to a ticket
    pub async fn is_subscribed(&self, ticket_id: &Uuid) -> bool {
        let subs = self.subscriptions.read().await;
        subs.contains(ticket_id)
    }

    /// Get all ticket subscriptions
    pub async fn get_subscriptions(&self) -> HashSet<Uuid> {
        let subs = self.subscriptions.read().await;
        subs.clone()
    }
}
