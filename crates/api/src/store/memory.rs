//! In-memory store backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use relaydesk_shared::{
    Appended, Channel, Customer, Message, MessageCursor, NewMessage, NewTicket, StoreError,
    Ticket, TicketStatus,
};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{CustomerUpsert, MessageStore, SessionStore};

#[derive(Default)]
struct Inner {
    customers: HashMap<Uuid, Customer>,
    customer_keys: HashMap<(Channel, String), Uuid>,
    tickets: HashMap<Uuid, Ticket>,
    /// Per-ticket log, always sorted by `(created_at, seq)`
    messages: HashMap<Uuid, Vec<Message>>,
    next_seq: i64,
}

/// Process-local store enforcing the same invariants as the Postgres schema
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored messages across all tickets.
    pub fn message_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.messages.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Number of stored tickets.
    pub fn ticket_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.tickets.len()).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_customer(
        &self,
        channel: Channel,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<CustomerUpsert, StoreError> {
        let mut inner = self.state()?;
        let key = (channel, external_id.to_string());

        if let Some(id) = inner.customer_keys.get(&key).copied() {
            let customer = inner
                .customers
                .get_mut(&id)
                .ok_or_else(|| StoreError::InvalidData(format!("dangling customer key {id}")))?;
            if let Some(hint) = display_name_hint {
                if customer.display_name.as_deref() != Some(hint) {
                    customer.display_name = Some(hint.to_string());
                }
            }
            return Ok(CustomerUpsert {
                customer: customer.clone(),
                inserted: false,
            });
        }

        let customer = Customer {
            id: Uuid::new_v4(),
            channel,
            external_id: external_id.to_string(),
            display_name: display_name_hint.map(str::to_string),
            metadata: serde_json::json!({}),
            first_seen_at: OffsetDateTime::now_utc(),
        };
        inner.customer_keys.insert(key, customer.id);
        inner.customers.insert(customer.id, customer.clone());

        Ok(CustomerUpsert {
            customer,
            inserted: true,
        })
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Customer, StoreError> {
        let inner = self.state()?;
        inner
            .customers
            .get(&customer_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("customer {customer_id}")))
    }

    async fn latest_ticket(
        &self,
        customer_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Ticket>, StoreError> {
        let inner = self.state()?;
        Ok(inner
            .tickets
            .values()
            .filter(|t| t.customer_id == customer_id && t.channel == channel)
            .max_by_key(|t| t.sequence_number)
            .cloned())
    }

    async fn create_ticket(&self, ticket: NewTicket) -> Result<Ticket, StoreError> {
        let mut inner = self.state()?;

        let clash = inner.tickets.values().find(|t| {
            t.customer_id == ticket.customer_id
                && t.channel == ticket.channel
                && (t.status.is_active() || t.sequence_number == ticket.sequence_number)
        });
        if let Some(existing) = clash {
            return Err(StoreError::Conflict(format!(
                "customer {} already has ticket {} (sequence {}, {})",
                ticket.customer_id, existing.id, existing.sequence_number, existing.status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let created = Ticket {
            id: Uuid::new_v4(),
            customer_id: ticket.customer_id,
            channel: ticket.channel,
            status: TicketStatus::Open,
            sequence_number: ticket.sequence_number,
            metadata: ticket.metadata,
            created_at: now,
            closed_at: None,
            last_activity_at: now,
        };
        inner.tickets.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Ticket, StoreError> {
        let inner = self.state()?;
        inner
            .tickets
            .get(&ticket_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))
    }

    async fn update_ticket_status(
        &self,
        ticket_id: Uuid,
        status: TicketStatus,
    ) -> Result<Ticket, StoreError> {
        let mut inner = self.state()?;
        let ticket = inner
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))?;

        if !ticket.status.is_active() {
            return Err(StoreError::TicketClosed(ticket_id));
        }
        ticket.status = status;
        if !status.is_active() {
            ticket.closed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(ticket.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: NewMessage) -> Result<Appended, StoreError> {
        let mut inner = self.state()?;

        let status = inner
            .tickets
            .get(&message.ticket_id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {}", message.ticket_id)))?;

        let log = inner.messages.entry(message.ticket_id).or_default();
        if let Some(provider_id) = message.provider_message_id.as_deref() {
            if let Some(existing) = log
                .iter()
                .find(|m| m.provider_message_id.as_deref() == Some(provider_id))
            {
                return Ok(Appended {
                    message: existing.clone(),
                    duplicate: true,
                });
            }
        }
        if !status.is_active() {
            return Err(StoreError::TicketClosed(message.ticket_id));
        }

        // Keep created_at non-decreasing within the ticket so commit order is read order.
        let now = OffsetDateTime::now_utc();
        let created_at = log.last().map_or(now, |last| last.created_at.max(now));

        inner.next_seq += 1;
        let stored = Message {
            id: Uuid::new_v4(),
            seq: inner.next_seq,
            ticket_id: message.ticket_id,
            provider_message_id: message.provider_message_id,
            direction: message.direction,
            sender_ref: message.sender_ref,
            body: message.body,
            provider_timestamp: message.provider_timestamp,
            created_at,
        };
        inner
            .messages
            .entry(stored.ticket_id)
            .or_default()
            .push(stored.clone());
        if let Some(ticket) = inner.tickets.get_mut(&stored.ticket_id) {
            ticket.last_activity_at = created_at;
        }

        Ok(Appended {
            message: stored,
            duplicate: false,
        })
    }

    async fn list_since(
        &self,
        ticket_id: Uuid,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.state()?;
        let Some(log) = inner.messages.get(&ticket_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|m| cursor.map_or(true, |c| c.precedes(m)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_recent(
        &self,
        ticket_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.state()?;
        let Some(log) = inner.messages.get(&ticket_id) else {
            return Ok(Vec::new());
        };
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    async fn find_by_provider_id(
        &self,
        customer_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.state()?;
        Ok(inner
            .tickets
            .values()
            .filter(|t| t.customer_id == customer_id)
            .filter_map(|t| inner.messages.get(&t.id))
            .flatten()
            .filter(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .min_by_key(|m| m.seq)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydesk_shared::Direction;

    async fn open_ticket(store: &MemoryStore) -> Ticket {
        let customer = store
            .upsert_customer(Channel::Whatsapp, "+5511999998888", Some("Ana"))
            .await
            .unwrap()
            .customer;
        store
            .create_ticket(NewTicket {
                customer_id: customer.id,
                channel: Channel::Whatsapp,
                sequence_number: 1,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap()
    }

    fn inbound(ticket_id: Uuid, provider_id: Option<&str>, body: &str) -> NewMessage {
        NewMessage {
            ticket_id,
            provider_message_id: provider_id.map(str::to_string),
            direction: Direction::Inbound,
            sender_ref: "+5511999998888".to_string(),
            body: body.to_string(),
            provider_timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_customer_refreshes_name() {
        let store = MemoryStore::new();
        let first = store
            .upsert_customer(Channel::Whatsapp, "+5511999998888", Some("Ana"))
            .await
            .unwrap();
        assert!(first.inserted);

        let renamed = store
            .upsert_customer(Channel::Whatsapp, "+5511999998888", Some("Ana Paula"))
            .await
            .unwrap();
        assert!(!renamed.inserted);
        assert_eq!(renamed.customer.id, first.customer.id);
        assert_eq!(renamed.customer.display_name.as_deref(), Some("Ana Paula"));

        let unnamed = store
            .upsert_customer(Channel::Whatsapp, "+5511999998888", None)
            .await
            .unwrap();
        assert_eq!(unnamed.customer.display_name.as_deref(), Some("Ana Paula"));
    }

    #[tokio::test]
    async fn test_second_active_ticket_conflicts() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;

        let result = store
            .create_ticket(NewTicket {
                customer_id: ticket.customer_id,
                channel: Channel::Whatsapp,
                sequence_number: 2,
                metadata: serde_json::json!({}),
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_append_dedups_by_provider_id() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;

        let first = store.append(inbound(ticket.id, Some("ABC"), "hello")).await.unwrap();
        let second = store.append(inbound(ticket.id, Some("ABC"), "hello")).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.message.id, second.message.id);
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_find_by_provider_id_spans_customer_tickets() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;
        let stored = store.append(inbound(ticket.id, Some("M1"), "Olá")).await.unwrap();
        store
            .update_ticket_status(ticket.id, TicketStatus::Closed)
            .await
            .unwrap();

        let found = store
            .find_by_provider_id(ticket.customer_id, "M1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, stored.message.id);
        assert!(store
            .find_by_provider_id(ticket.customer_id, "M2")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_by_provider_id(Uuid::new_v4(), "M1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_messages_without_provider_id_are_never_deduped() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;

        store.append(inbound(ticket.id, None, "one")).await.unwrap();
        store.append(inbound(ticket.id, None, "one")).await.unwrap();
        assert_eq!(store.message_count(), 2);
    }

    #[tokio::test]
    async fn test_append_to_closed_ticket_is_rejected() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;
        store.append(inbound(ticket.id, Some("A1"), "before")).await.unwrap();
        store
            .update_ticket_status(ticket.id, TicketStatus::Closed)
            .await
            .unwrap();

        let result = store.append(inbound(ticket.id, Some("A2"), "after")).await;
        assert!(matches!(result, Err(StoreError::TicketClosed(id)) if id == ticket.id));

        // Redelivery of an already stored message still resolves to the original row.
        let replay = store.append(inbound(ticket.id, Some("A1"), "before")).await.unwrap();
        assert!(replay.duplicate);
    }

    #[tokio::test]
    async fn test_closed_ticket_status_is_final() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;
        let closed = store
            .update_ticket_status(ticket.id, TicketStatus::Closed)
            .await
            .unwrap();
        assert!(closed.closed_at.is_some());

        let reopen = store.update_ticket_status(ticket.id, TicketStatus::Open).await;
        assert!(matches!(reopen, Err(StoreError::TicketClosed(_))));
    }

    #[tokio::test]
    async fn test_list_since_is_ordered_and_restartable() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;
        for i in 0..5 {
            let mut msg = inbound(ticket.id, None, &format!("m{i}"));
            if i % 2 == 1 {
                msg.direction = Direction::Outbound;
            }
            store.append(msg).await.unwrap();
        }

        let page = store.list_since(ticket.id, None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        let rest = store
            .list_since(ticket.id, Some(page[1].cursor()), 10)
            .await
            .unwrap();
        let bodies: Vec<_> = page.iter().chain(rest.iter()).map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m0", "m1", "m2", "m3", "m4"]);

        let all = store.list_since(ticket.id, None, 10).await.unwrap();
        assert!(all
            .windows(2)
            .all(|w| (w[0].created_at, w[0].seq) < (w[1].created_at, w[1].seq)));
    }

    #[tokio::test]
    async fn test_list_recent_returns_tail_in_order() {
        let store = MemoryStore::new();
        let ticket = open_ticket(&store).await;
        for i in 0..5 {
            store.append(inbound(ticket.id, None, &format!("m{i}"))).await.unwrap();
        }

        let recent = store.list_recent(ticket.id, 3).await.unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.ping().await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
