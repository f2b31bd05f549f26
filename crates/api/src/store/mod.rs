//! Persistence boundary for customers, tickets and messages
//!
//! The relational store itself is an external collaborator; the pipeline
//! only talks to it through these traits. Two backends are provided:
//!
//! - [`MemoryStore`]: process-local, used for development and tests
//! - [`PgStore`]: PostgreSQL via `sqlx`

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use relaydesk_shared::{
    Appended, Channel, Customer, Message, MessageCursor, NewMessage, NewTicket, StoreError,
    Ticket, TicketStatus,
};
use uuid::Uuid;

/// Result of a customer upsert
#[derive(Debug, Clone)]
pub struct CustomerUpsert {
    pub customer: Customer,
    /// True when this call created the customer
    pub inserted: bool,
}

/// Customer and ticket persistence used by the session resolver
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert the customer for `(channel, external_id)` or refresh its display name.
    ///
    /// A `None` hint never clears a stored name.
    async fn upsert_customer(
        &self,
        channel: Channel,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<CustomerUpsert, StoreError>;

    async fn get_customer(&self, customer_id: Uuid) -> Result<Customer, StoreError>;

    /// Most recent ticket for the customer on `channel`, by sequence number.
    async fn latest_ticket(
        &self,
        customer_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Create an open ticket.
    ///
    /// Fails with [`StoreError::Conflict`] when the customer already has an
    /// active ticket on the channel or the sequence number is taken.
    async fn create_ticket(&self, ticket: NewTicket) -> Result<Ticket, StoreError>;

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Ticket, StoreError>;

    /// Agent-driven status transition. Closed and cancelled tickets are final.
    async fn update_ticket_status(
        &self,
        ticket_id: Uuid,
        status: TicketStatus,
    ) -> Result<Ticket, StoreError>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for health output.
    fn backend(&self) -> &'static str;
}

/// Append-only message log, one ordered log per ticket
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Append a message, or return the stored row when
    /// `(ticket_id, provider_message_id)` already exists.
    ///
    /// Fails with [`StoreError::TicketClosed`] for closed or cancelled tickets.
    async fn append(&self, message: NewMessage) -> Result<Appended, StoreError>;

    /// Messages strictly after `cursor` (from the start when `None`), oldest first.
    async fn list_since(
        &self,
        ticket_id: Uuid,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// The `limit` most recent messages, oldest first.
    async fn list_recent(&self, ticket_id: Uuid, limit: usize)
        -> Result<Vec<Message>, StoreError>;

    /// Earliest message carrying `provider_message_id` on any of the customer's tickets.
    async fn find_by_provider_id(
        &self,
        customer_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;
}
