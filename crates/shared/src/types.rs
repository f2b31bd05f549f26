//! Common types used across Relaydesk

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Messaging channel a customer reaches us through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Channel::Whatsapp),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Ticket lifecycle status
///
/// This is the only status vocabulary stored or compared against. Older
/// tooling used Portuguese and legacy labels; those are accepted as aliases
/// on input and never produce distinct states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[serde(alias = "aberto", alias = "pending")]
    Open,
    #[serde(alias = "em_atendimento", alias = "in-progress")]
    InProgress,
    #[serde(alias = "finalizado", alias = "fechado", alias = "resolved")]
    Closed,
    #[serde(alias = "cancelado", alias = "canceled")]
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Closed => "closed",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// Open and in-progress tickets still accept messages.
    pub fn is_active(&self) -> bool {
        matches!(self, TicketStatus::Open | TicketStatus::InProgress)
    }

    /// Map a canonical name or a legacy display alias onto the canonical status.
    pub fn from_alias(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "open" | "aberto" | "pending" => Some(TicketStatus::Open),
            "in_progress" | "in-progress" | "em_atendimento" => Some(TicketStatus::InProgress),
            "closed" | "finalizado" | "fechado" | "resolved" => Some(TicketStatus::Closed),
            "cancelled" | "canceled" | "cancelado" => Some(TicketStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TicketStatus::from_alias(s).ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Who authored a message relative to the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Sent by the customer through the provider
    Inbound,
    /// Sent by an agent to the customer
    Outbound,
    /// Visible to agents only, never delivered to the customer
    InternalNote,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::InternalNote => "internal-note",
        }
    }
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            "internal-note" => Ok(Direction::InternalNote),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A stored string did not match any known enum variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct UnknownVariant(pub String);

// =============================================================================
// Customers and tickets
// =============================================================================

/// A person reachable on a channel, keyed by `(channel, external_id)`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub channel: Channel,
    /// E.164 phone number for WhatsApp
    pub external_id: String,
    pub display_name: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
}

/// One bounded conversation with a customer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub channel: Channel,
    pub status: TicketStatus,
    /// Starts at 1 and increases by one for every reopened conversation
    pub sequence_number: i32,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

/// Input for creating a ticket
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub customer_id: Uuid,
    pub channel: Channel,
    pub sequence_number: i32,
    pub metadata: serde_json::Value,
}

// =============================================================================
// Messages
// =============================================================================

/// An append-only message on a ticket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    /// Insertion order, used to break `created_at` ties
    pub seq: i64,
    pub ticket_id: Uuid,
    pub provider_message_id: Option<String>,
    pub direction: Direction,
    /// Customer external id for inbound messages, agent user id otherwise
    pub sender_ref: String,
    pub body: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub provider_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Cursor pointing just past this message.
    pub fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            seq: self.seq,
        }
    }
}

/// Input for appending a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub ticket_id: Uuid,
    pub provider_message_id: Option<String>,
    pub direction: Direction,
    pub sender_ref: String,
    pub body: String,
    pub provider_timestamp: Option<OffsetDateTime>,
}

/// Result of an append; `duplicate` is set when the provider id was already stored
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    pub duplicate: bool,
}

/// Restartable position in a ticket's message log
///
/// Messages are ordered by `(created_at, seq)`. On the wire the cursor is an
/// opaque `"<unix nanos>.<seq>"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageCursor {
    pub created_at: OffsetDateTime,
    pub seq: i64,
}

impl MessageCursor {
    /// Whether `message` sorts strictly after this cursor.
    pub fn precedes(&self, message: &Message) -> bool {
        (message.created_at, message.seq) > (self.created_at, self.seq)
    }
}

impl fmt::Display for MessageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.created_at.unix_timestamp_nanos(), self.seq)
    }
}

impl FromStr for MessageCursor {
    type Err = InvalidCursor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (nanos, seq) = s.split_once('.').ok_or(InvalidCursor)?;
        let nanos: i128 = nanos.parse().map_err(|_| InvalidCursor)?;
        let seq: i64 = seq.parse().map_err(|_| InvalidCursor)?;
        let created_at =
            OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| InvalidCursor)?;
        Ok(Self { created_at, seq })
    }
}

impl Serialize for MessageCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid message cursor")]
pub struct InvalidCursor;
