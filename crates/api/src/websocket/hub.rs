//! Connection hub
//!
//! Owns every live connection and the ticket rooms, and is the only path by
//! which message events reach agents. Appending a message and publishing it
//! happen under the ticket's ordering lock, as does a subscriber's catch-up,
//! so each subscriber sees a ticket's events in commit order with no gap
//! between catch-up and live delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use relaydesk_shared::{Appended, Message, MessageCursor, NewMessage, StoreError};

use super::connection::{Connection, ConnectionState};
use super::events::ServerEvent;
use super::room::RoomManager;
use crate::keyed_lock::KeyedLocks;
use crate::store::MessageStore;

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered per connection before the oldest is dropped
    pub outbound_queue_capacity: usize,
    /// Messages delivered on join when the client sends no cursor
    pub catchup_limit: usize,
    /// Expected client ping period; two missed periods disconnect
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            catchup_limit: 50,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Errors surfaced to the client as `error` events
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Connection {0} not found")]
    ConnectionNotFound(Uuid),

    #[error("Not subscribed to ticket {0}")]
    SubscriptionNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Statistics about live connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

impl From<HubStats> for ServerEvent {
    fn from(stats: HubStats) -> Self {
        ServerEvent::ConnectionStats {
            active_connections: stats.active_connections,
            active_rooms: stats.active_rooms,
        }
    }
}

/// Shared hub handle
#[derive(Clone)]
pub struct ConnectionHub {
    /// All active connections indexed by connection id
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
    rooms: Arc<RoomManager>,
    messages: Arc<dyn MessageStore>,
    ticket_locks: Arc<KeyedLocks<Uuid>>,
    config: HubConfig,
}

impl ConnectionHub {
    pub fn new(messages: Arc<dyn MessageStore>, config: HubConfig) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RoomManager::new()),
            messages,
            ticket_locks: Arc::new(KeyedLocks::new()),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a new connection and greet it.
    pub async fn connect(&self, user_id: Uuid, user_name: impl Into<String>) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            user_id,
            user_name,
            self.config.outbound_queue_capacity,
        ));

        let total = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.connection_id, Arc::clone(&conn));
            connections.len()
        };
        conn.set_state(ConnectionState::Connected);
        let _ = conn.send(ServerEvent::Connected {
            connection_id: conn.connection_id,
        });

        tracing::info!(
            connection_id = %conn.connection_id,
            user_id = %user_id,
            total_connections = total,
            "WebSocket connection added"
        );
        conn
    }

    /// Get a connection by id
    pub async fn get_connection(&self, connection_id: &Uuid) -> Option<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections.get(connection_id).cloned()
    }

    async fn require_connection(&self, connection_id: Uuid) -> Result<Arc<Connection>, HubError> {
        self.get_connection(&connection_id)
            .await
            .ok_or(HubError::ConnectionNotFound(connection_id))
    }

    /// Join a ticket room and deliver the catch-up page.
    ///
    /// With `after`, the page holds messages strictly after that cursor;
    /// otherwise the most recent `catchup_limit` messages. Returns the number
    /// of messages delivered.
    pub async fn subscribe(
        &self,
        connection_id: Uuid,
        ticket_id: Uuid,
        after: Option<MessageCursor>,
    ) -> Result<usize, HubError> {
        let conn = self.require_connection(connection_id).await?;
        let limit = self.config.catchup_limit;

        let _order = self.ticket_locks.lock(ticket_id).await;
        let messages = match after {
            Some(cursor) => self.messages.list_since(ticket_id, Some(cursor), limit).await?,
            None => self.messages.list_recent(ticket_id, limit).await?,
        };

        conn.subscribe(ticket_id).await;
        self.rooms.join(ticket_id, Arc::clone(&conn)).await;

        // `disconnect` closes before clearing rooms, so a teardown that ran
        // while we waited is visible here and the join is undone.
        if conn.state() == ConnectionState::Disconnected {
            self.rooms.leave(&ticket_id, &connection_id).await;
            return Err(HubError::ConnectionNotFound(connection_id));
        }

        let delivered = messages.len();
        let _ = conn.send(ServerEvent::JoinedTicket { ticket_id });
        let _ = conn.send(messages_loaded(ticket_id, messages));

        tracing::info!(
            connection_id = %connection_id,
            ticket_id = %ticket_id,
            resumed = after.is_some(),
            catchup = delivered,
            "Connection joined ticket"
        );
        Ok(delivered)
    }

    /// Leave a ticket room; returns whether the connection was subscribed.
    pub async fn unsubscribe(&self, connection_id: Uuid, ticket_id: Uuid) -> Result<bool, HubError> {
        let conn = self.require_connection(connection_id).await?;
        let was_subscribed = conn.unsubscribe(ticket_id).await;
        self.rooms.leave(&ticket_id, &connection_id).await;
        Ok(was_subscribed)
    }

    /// Send a page of a joined ticket's messages to one connection.
    pub async fn load_messages(
        &self,
        connection_id: Uuid,
        ticket_id: Uuid,
        limit: Option<usize>,
        after: Option<MessageCursor>,
    ) -> Result<usize, HubError> {
        let conn = self.require_connection(connection_id).await?;
        if !conn.is_subscribed(&ticket_id).await {
            return Err(HubError::SubscriptionNotFound(ticket_id));
        }

        let limit = limit
            .unwrap_or(self.config.catchup_limit)
            .clamp(1, self.config.catchup_limit.max(1) * 4);
        let messages = match after {
            Some(cursor) => self.messages.list_since(ticket_id, Some(cursor), limit).await?,
            None => self.messages.list_recent(ticket_id, limit).await?,
        };
        let count = messages.len();
        let _ = conn.send(messages_loaded(ticket_id, messages));
        Ok(count)
    }

    /// Broadcast an event to a ticket's subscribers; returns how many received it.
    ///
    /// Connections found closed during the broadcast are disconnected.
    pub async fn publish(&self, ticket_id: Uuid, event: ServerEvent) -> usize {
        let report = self.rooms.broadcast(&ticket_id, &event).await;
        for connection_id in report.failed {
            if self.disconnect(connection_id).await.is_none() {
                // Already torn down elsewhere; drop the stale room entry.
                self.rooms.remove_connection(&connection_id).await;
            }
        }
        report.delivered
    }

    /// Persist a message and fan it out in commit order.
    ///
    /// A redelivered provider message is returned as a duplicate and not
    /// published again.
    pub async fn append_and_publish(&self, message: NewMessage) -> Result<Appended, StoreError> {
        let ticket_id = message.ticket_id;
        let _order = self.ticket_locks.lock(ticket_id).await;

        let appended = self.messages.append(message).await?;
        if appended.duplicate {
            tracing::debug!(
                ticket_id = %ticket_id,
                message_id = %appended.message.id,
                "Duplicate message not republished"
            );
            return Ok(appended);
        }

        let recipients = self
            .publish(
                ticket_id,
                ServerEvent::NewMessage {
                    message: appended.message.clone(),
                },
            )
            .await;
        tracing::debug!(
            ticket_id = %ticket_id,
            message_id = %appended.message.id,
            recipients,
            "Published new message"
        );
        Ok(appended)
    }

    /// Queue an event for one connection
    pub async fn send_to(&self, connection_id: Uuid, event: ServerEvent) -> Result<(), HubError> {
        let conn = self.require_connection(connection_id).await?;
        if conn.send(event).is_err() {
            self.disconnect(connection_id).await;
            return Err(HubError::ConnectionNotFound(connection_id));
        }
        Ok(())
    }

    /// Tear down a connection. Safe to call more than once.
    ///
    /// Returns the tickets it was subscribed to, or `None` if it was already gone.
    pub async fn disconnect(&self, connection_id: Uuid) -> Option<Vec<Uuid>> {
        let (conn, remaining) = {
            let mut connections = self.connections.write().await;
            let conn = connections.remove(&connection_id)?;
            (conn, connections.len())
        };

        conn.close();
        let tickets = self.rooms.remove_connection(&connection_id).await;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %conn.user_id,
            remaining_connections = remaining,
            "WebSocket connection removed"
        );
        Some(tickets)
    }

    /// Record a heartbeat from the client.
    pub async fn record_ping(&self, connection_id: Uuid) -> Result<(), HubError> {
        self.require_connection(connection_id).await?.touch();
        Ok(())
    }

    /// Disconnect every connection silent for two heartbeat intervals.
    pub async fn reap_stale(&self, now: Instant) -> Vec<Arc<Connection>> {
        let deadline = self.config.heartbeat_interval * 2;
        let stale: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| now.saturating_duration_since(c.last_seen()) > deadline)
                .cloned()
                .collect()
        };

        for conn in &stale {
            tracing::warn!(
                connection_id = %conn.connection_id,
                user_id = %conn.user_id,
                "Heartbeat missed, disconnecting"
            );
            self.disconnect(conn.connection_id).await;
        }
        stale
    }

    /// Periodically reap connections that stopped pinging.
    pub fn spawn_heartbeat_monitor(&self) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = hub.reap_stale(Instant::now()).await;
                if !reaped.is_empty() {
                    tracing::info!(reaped = reaped.len(), "Reaped stale connections");
                }
            }
        })
    }

    /// Get total number of active connections
    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    /// Number of connections subscribed to a ticket
    pub async fn subscriber_count(&self, ticket_id: &Uuid) -> usize {
        self.rooms.get_room_size(ticket_id).await
    }

    pub async fn get_stats(&self) -> HubStats {
        HubStats {
            active_connections: self.connection_count().await,
            active_rooms: self.rooms.get_room_count().await,
        }
    }
}

fn messages_loaded(ticket_id: Uuid, messages: Vec<Message>) -> ServerEvent {
    let next_cursor = messages.last().map(Message::cursor);
    ServerEvent::MessagesLoaded {
        ticket_id,
        messages,
        next_cursor,
    }
}
