//! Ticket room management for pub/sub
//!
//! Manages ticket "rooms" for broadcasting events to all subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;

/// Result of a broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections whose queue was already closed
    pub failed: Vec<Uuid>,
}

/// Manages ticket "rooms" for broadcasting events
pub struct RoomManager {
    /// Map of ticket_id -> list of connections
    rooms: RwLock<HashMap<Uuid, Vec<Arc<Connection>>>>,
}

impl RoomManager {
    /// Create a new room manager
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection to a ticket room. Joining twice is a no-op.
    pub async fn join(&self, ticket_id: Uuid, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(ticket_id).or_default();
        if !room.iter().any(|c| c.connection_id == conn.connection_id) {
            room.push(Arc::clone(&conn));
        }

        tracing::debug!(
            ticket_id = %ticket_id,
            connection_id = %conn.connection_id,
            room_size = room.len(),
            "Connection joined ticket room"
        );
    }

    /// Remove a connection from a ticket room
    pub async fn leave(&self, ticket_id: &Uuid, connection_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(ticket_id) {
            conns.retain(|c| c.connection_id != *connection_id);

            if conns.is_empty() {
                rooms.remove(ticket_id);
                tracing::debug!(ticket_id = %ticket_id, "Removed empty ticket room");
            } else {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    connection_id = %connection_id,
                    room_size = conns.len(),
                    "Connection left ticket room"
                );
            }
        }
    }

    /// Queue an event on every connection in a ticket room.
    ///
    /// Never waits on a socket; closed connections are reported back so the
    /// hub can tear them down.
    pub async fn broadcast(&self, ticket_id: &Uuid, event: &ServerEvent) -> BroadcastReport {
        let rooms = self.rooms.read().await;
        let mut report = BroadcastReport::default();

        let Some(conns) = rooms.get(ticket_id) else {
            tracing::debug!(
                ticket_id = %ticket_id,
                event_type = event.kind(),
                "No subscribers for ticket"
            );
            return report;
        };

        for conn in conns {
            match conn.send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        connection_id = %conn.connection_id,
                        "Failed to send event to connection (closed)"
                    );
                    report.failed.push(conn.connection_id);
                }
            }
        }

        tracing::debug!(
            ticket_id = %ticket_id,
            event_type = event.kind(),
            recipients = report.delivered,
            failed = report.failed.len(),
            "Broadcast event to ticket room"
        );
        report
    }

    /// Remove a connection from all rooms; returns the tickets it left.
    pub async fn remove_connection(&self, connection_id: &Uuid) -> Vec<Uuid> {
        let mut rooms = self.rooms.write().await;
        let mut removed_from = Vec::new();

        for (ticket_id, conns) in rooms.iter_mut() {
            let before_len = conns.len();
            conns.retain(|c| c.connection_id != *connection_id);
            if conns.len() < before_len {
                removed_from.push(*ticket_id);
            }
        }

        rooms.retain(|_, conns| !conns.is_empty());

        if !removed_from.is_empty() {
            tracing::debug!(
                connection_id = %connection_id,
                ticket_count = removed_from.len(),
                "Removed connection from rooms"
            );
        }
        removed_from
    }

    /// Get room size (number of connections) for a ticket
    pub async fn get_room_size(&self, ticket_id: &Uuid) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(ticket_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Get total number of active rooms
    pub async fn get_room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
