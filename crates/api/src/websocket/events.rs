//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client event types
//! with type-safe serde serialization. Frames are JSON objects tagged by a
//! kebab-case `type` with camelCase fields.

use relaydesk_shared::{Message, MessageCursor, TicketStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the real-time protocol, reported by the health endpoint
pub const PROTOCOL_VERSION: &str = "1";

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Subscribe to a ticket and receive a catch-up of its recent messages
    JoinTicket {
        ticket_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
        /// Resume after the last message the client already has
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<MessageCursor>,
    },

    /// Stop receiving events for a ticket
    LeaveTicket { ticket_id: Uuid },

    /// Reload messages of a joined ticket
    RequestMessages {
        ticket_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<MessageCursor>,
    },

    /// Agent reply or internal note
    SendMessage {
        ticket_id: Uuid,
        content: String,
        #[serde(default)]
        is_internal: bool,
    },

    /// Start typing in a ticket
    TypingStart { ticket_id: Uuid },

    /// Stop typing in a ticket
    TypingStop { ticket_id: Uuid },

    /// Heartbeat ping to keep connection alive
    Ping,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected { connection_id: Uuid },

    /// Subscription to a ticket is active
    JoinedTicket { ticket_id: Uuid },

    /// Catch-up or explicitly requested page of messages, oldest first
    MessagesLoaded {
        ticket_id: Uuid,
        messages: Vec<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<MessageCursor>,
    },

    /// New message added to ticket
    NewMessage { message: Message },

    /// An agent reply was handed to the messaging provider
    MessageAck {
        ticket_id: Uuid,
        message_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_message_id: Option<String>,
    },

    /// Ticket status changed
    TicketUpdated {
        ticket_id: Uuid,
        status: TicketStatus,
    },

    /// User started typing in ticket
    TypingStart {
        ticket_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },

    /// User stopped typing in ticket
    TypingStop {
        ticket_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },

    /// Hub-wide counters
    ConnectionStats {
        active_connections: usize,
        active_rooms: usize,
    },

    /// Error message
    Error { message: String },

    /// Heartbeat response; unix milliseconds
    Pong { timestamp: i64 },
}

impl ServerEvent {
    /// Tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::JoinedTicket { .. } => "joined-ticket",
            ServerEvent::MessagesLoaded { .. } => "messages-loaded",
            ServerEvent::NewMessage { .. } => "new-message",
            ServerEvent::MessageAck { .. } => "message-ack",
            ServerEvent::TicketUpdated { .. } => "ticket-updated",
            ServerEvent::TypingStart { .. } => "typing-start",
            ServerEvent::TypingStop { .. } => "typing-stop",
            ServerEvent::ConnectionStats { .. } => "connection-stats",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}
