//! PostgreSQL store backend
//!
//! Invariants are enforced by the schema (see `migrations/`):
//! - `tickets_one_active_per_customer` partial unique index
//! - `messages_provider_dedup` partial unique index
//!
//! Appends lock the ticket row so the per-ticket log is written serially.

use async_trait::async_trait;
use relaydesk_shared::{
    Appended, Channel, Customer, Direction, Message, MessageCursor, NewMessage, NewTicket,
    StoreError, Ticket, TicketStatus,
};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{CustomerUpsert, MessageStore, SessionStore};

/// Store backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(FromRow)]
struct CustomerRow {
    id: Uuid,
    channel: String,
    external_id: String,
    display_name: Option<String>,
    metadata: serde_json::Value,
    first_seen_at: OffsetDateTime,
}

impl TryFrom<CustomerRow> for Customer {
    type Error = StoreError;

    fn try_from(row: CustomerRow) -> Result<Self, Self::Error> {
        Ok(Customer {
            id: row.id,
            channel: parse_column(&row.channel)?,
            external_id: row.external_id,
            display_name: row.display_name,
            metadata: row.metadata,
            first_seen_at: row.first_seen_at,
        })
    }
}

#[derive(FromRow)]
struct TicketRow {
    id: Uuid,
    customer_id: Uuid,
    channel: String,
    status: String,
    sequence_number: i32,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    closed_at: Option<OffsetDateTime>,
    last_activity_at: OffsetDateTime,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(Ticket {
            id: row.id,
            customer_id: row.customer_id,
            channel: parse_column(&row.channel)?,
            status: parse_column(&row.status)?,
            sequence_number: row.sequence_number,
            metadata: row.metadata,
            created_at: row.created_at,
            closed_at: row.closed_at,
            last_activity_at: row.last_activity_at,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    seq: i64,
    ticket_id: Uuid,
    provider_message_id: Option<String>,
    direction: String,
    sender_ref: String,
    body: String,
    provider_timestamp: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            seq: row.seq,
            ticket_id: row.ticket_id,
            provider_message_id: row.provider_message_id,
            direction: parse_column::<Direction>(&row.direction)?,
            sender_ref: row.sender_ref,
            body: row.body,
            provider_timestamp: row.provider_timestamp,
            created_at: row.created_at,
        })
    }
}

fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::InvalidData(e.to_string()))
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
    rows.into_iter().map(Message::try_from).collect()
}

const TICKET_COLUMNS: &str = "id, customer_id, channel, status, sequence_number, metadata, \
                              created_at, closed_at, last_activity_at";

const MESSAGE_COLUMNS: &str = "id, seq, ticket_id, provider_message_id, direction, sender_ref, \
                               body, provider_timestamp, created_at";

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// =============================================================================
// SessionStore
// =============================================================================

#[async_trait]
impl SessionStore for PgStore {
    async fn upsert_customer(
        &self,
        channel: Channel,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<CustomerUpsert, StoreError> {
        #[derive(FromRow)]
        struct UpsertRow {
            #[sqlx(flatten)]
            customer: CustomerRow,
            inserted: bool,
        }

        let row: UpsertRow = sqlx::query_as(
            r#"
            INSERT INTO customers (id, channel, external_id, display_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (channel, external_id) DO UPDATE SET
              display_name = COALESCE(EXCLUDED.display_name, customers.display_name),
              updated_at = CASE
                WHEN EXCLUDED.display_name IS NOT NULL
                 AND EXCLUDED.display_name IS DISTINCT FROM customers.display_name
                THEN NOW()
                ELSE customers.updated_at
              END
            RETURNING id, channel, external_id, display_name, metadata, first_seen_at,
                      (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(channel.as_str())
        .bind(external_id)
        .bind(display_name_hint)
        .fetch_one(&self.pool)
        .await?;

        Ok(CustomerUpsert {
            customer: row.customer.try_into()?,
            inserted: row.inserted,
        })
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Customer, StoreError> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT id, channel, external_id, display_name, metadata, first_seen_at
            FROM customers
            WHERE id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::NotFound(format!("customer {customer_id}")))?
            .try_into()
    }

    async fn latest_ticket(
        &self,
        customer_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Ticket>, StoreError> {
        let row: Option<TicketRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TICKET_COLUMNS}
            FROM tickets
            WHERE customer_id = $1 AND channel = $2
            ORDER BY sequence_number DESC
            LIMIT 1
            "#
        ))
        .bind(customer_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Ticket::try_from).transpose()
    }

    async fn create_ticket(&self, ticket: NewTicket) -> Result<Ticket, StoreError> {
        let row: TicketRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO tickets (id, customer_id, channel, status, sequence_number, metadata)
            VALUES ($1, $2, $3, 'open', $4, $5)
            RETURNING {TICKET_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(ticket.customer_id)
        .bind(ticket.channel.as_str())
        .bind(ticket.sequence_number)
        .bind(&ticket.metadata)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Ticket, StoreError> {
        let row: Option<TicketRow> =
            sqlx::query_as(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
                .bind(ticket_id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))?
            .try_into()
    }

    async fn update_ticket_status(
        &self,
        ticket_id: Uuid,
        status: TicketStatus,
    ) -> Result<Ticket, StoreError> {
        let row: Option<TicketRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tickets
            SET status = $2,
                closed_at = CASE WHEN $2 IN ('closed', 'cancelled') THEN NOW() ELSE closed_at END
            WHERE id = $1 AND status IN ('open', 'in_progress')
            RETURNING {TICKET_COLUMNS}
            "#
        ))
        .bind(ticket_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            // Either missing or already final; tell the two apart.
            None => match self.get_ticket(ticket_id).await {
                Ok(_) => Err(StoreError::TicketClosed(ticket_id)),
                Err(e) => Err(e),
            },
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

// =============================================================================
// MessageStore
// =============================================================================

#[async_trait]
impl MessageStore for PgStore {
    async fn append(&self, message: NewMessage) -> Result<Appended, StoreError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM tickets WHERE id = $1 FOR UPDATE")
                .bind(message.ticket_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status: TicketStatus = match status {
            Some(s) => parse_column(&s)?,
            None => return Err(StoreError::NotFound(format!("ticket {}", message.ticket_id))),
        };

        if let Some(provider_id) = message.provider_message_id.as_deref() {
            let existing: Option<MessageRow> = sqlx::query_as(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS}
                FROM messages
                WHERE ticket_id = $1 AND provider_message_id = $2
                "#
            ))
            .bind(message.ticket_id)
            .bind(provider_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok(Appended {
                    message: row.try_into()?,
                    duplicate: true,
                });
            }
        }

        if !status.is_active() {
            return Err(StoreError::TicketClosed(message.ticket_id));
        }

        // The ticket row lock serializes appends, so clamping against the
        // current maximum keeps created_at non-decreasing in commit order.
        let row: MessageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO messages
              (id, ticket_id, provider_message_id, direction, sender_ref, body,
               provider_timestamp, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7,
              GREATEST(
                clock_timestamp(),
                COALESCE((SELECT MAX(created_at) FROM messages WHERE ticket_id = $2),
                         '-infinity'::timestamptz)
              ))
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(message.ticket_id)
        .bind(&message.provider_message_id)
        .bind(message.direction.as_str())
        .bind(&message.sender_ref)
        .bind(&message.body)
        .bind(message.provider_timestamp)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE tickets SET last_activity_at = $2 WHERE id = $1")
            .bind(message.ticket_id)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Appended {
            message: row.try_into()?,
            duplicate: false,
        })
    }

    async fn list_since(
        &self,
        ticket_id: Uuid,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE ticket_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, seq) > ($2, $3))
            ORDER BY created_at ASC, seq ASC
            LIMIT $4
            "#
        ))
        .bind(ticket_id)
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map_or(0, |c| c.seq))
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn list_recent(
        &self,
        ticket_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM (
              SELECT {MESSAGE_COLUMNS}
              FROM messages
              WHERE ticket_id = $1
              ORDER BY created_at DESC, seq DESC
              LIMIT $2
            ) recent
            ORDER BY created_at ASC, seq ASC
            "#
        ))
        .bind(ticket_id)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn find_by_provider_id(
        &self,
        customer_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE provider_message_id = $2
              AND ticket_id IN (SELECT id FROM tickets WHERE customer_id = $1)
            ORDER BY seq ASC
            LIMIT 1
            "#
        ))
        .bind(customer_id)
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = relaydesk_shared::create_pool(&url, 4)
            .await
            .expect("Failed to create pool");
        relaydesk_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pg_dedup_and_reopen_invariants() {
        let store = store().await;
        let external_id = format!("+55119{}", &Uuid::new_v4().as_u128().to_string()[..8]);

        let customer = store
            .upsert_customer(Channel::Whatsapp, &external_id, Some("Test"))
            .await
            .unwrap()
            .customer;
        let ticket = store
            .create_ticket(NewTicket {
                customer_id: customer.id,
                channel: Channel::Whatsapp,
                sequence_number: 1,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let second_active = store
            .create_ticket(NewTicket {
                customer_id: customer.id,
                channel: Channel::Whatsapp,
                sequence_number: 2,
                metadata: serde_json::json!({}),
            })
            .await;
        assert!(matches!(second_active, Err(StoreError::Conflict(_))));

        let message = NewMessage {
            ticket_id: ticket.id,
            provider_message_id: Some("PG-1".into()),
            direction: Direction::Inbound,
            sender_ref: external_id.clone(),
            body: "hello".into(),
            provider_timestamp: None,
        };
        let first = store.append(message.clone()).await.unwrap();
        let again = store.append(message).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(first.message.id, again.message.id);

        store
            .update_ticket_status(ticket.id, TicketStatus::Closed)
            .await
            .unwrap();
        let latest = store
            .latest_ticket(customer.id, Channel::Whatsapp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, TicketStatus::Closed);
    }
}
