//! Find-or-create resolution of a sender to its active conversation
//!
//! Every resolution for the same `(channel, external_id)` runs under one
//! in-process lock. Across processes the partial unique index on active
//! tickets turns a lost race into [`StoreError::Conflict`], which is resolved
//! by re-reading the winner's ticket.

use std::sync::Arc;

use relaydesk_shared::{Channel, Customer, Message, NewTicket, StoreError, Ticket};
use serde::Serialize;
use uuid::Uuid;

use crate::keyed_lock::KeyedLocks;
use crate::store::{CustomerUpsert, MessageStore, SessionStore};
use crate::webhook::Identity;

/// How many times a lost create race is retried before giving up
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Outcome of [`SessionResolver::resolve`]
#[derive(Debug, Clone)]
pub struct Resolution {
    pub customer: Customer,
    pub ticket: Ticket,
    /// A ticket was created by this call
    pub created: bool,
    /// The created ticket follows a closed or cancelled one
    pub reopened: bool,
    /// The customer record was created by this call
    pub customer_created: bool,
}

/// Outcome of [`SessionResolver::resolve_inbound`]
#[derive(Debug, Clone)]
pub enum InboundResolution {
    Resolved(Resolution),
    /// The provider message is already stored on one of the customer's tickets
    Redelivered { customer: Customer, message: Message },
}

/// Wire form of a resolution for the session RPC
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub ticket_id: Uuid,
    pub customer_id: Uuid,
    pub is_new: bool,
    pub sequence_number: i32,
}

impl From<&Resolution> for SessionSummary {
    fn from(resolution: &Resolution) -> Self {
        Self {
            ticket_id: resolution.ticket.id,
            customer_id: resolution.customer.id,
            is_new: resolution.created,
            sequence_number: resolution.ticket.sequence_number,
        }
    }
}

/// Maps external identities onto `(Customer, Ticket)` pairs
pub struct SessionResolver {
    store: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    locks: KeyedLocks<(Channel, String)>,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn SessionStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            messages,
            locks: KeyedLocks::new(),
        }
    }

    /// Resolve `identity` to its single active ticket, creating one if needed.
    pub async fn resolve(
        &self,
        identity: &Identity,
        display_name_hint: Option<&str>,
    ) -> Result<Resolution, StoreError> {
        let _guard = self
            .locks
            .lock((identity.channel, identity.external_id.clone()))
            .await;

        let upsert = self
            .store
            .upsert_customer(identity.channel, &identity.external_id, display_name_hint)
            .await?;
        self.active_ticket(identity, upsert).await
    }

    /// Like [`resolve`](Self::resolve), but a provider message already stored
    /// for this customer short-circuits to that message instead of opening a
    /// ticket. A redelivery after the original ticket closed must not reopen.
    pub async fn resolve_inbound(
        &self,
        identity: &Identity,
        display_name_hint: Option<&str>,
        provider_message_id: Option<&str>,
    ) -> Result<InboundResolution, StoreError> {
        let _guard = self
            .locks
            .lock((identity.channel, identity.external_id.clone()))
            .await;

        let upsert = self
            .store
            .upsert_customer(identity.channel, &identity.external_id, display_name_hint)
            .await?;

        if let Some(provider_id) = provider_message_id {
            if let Some(message) = self
                .messages
                .find_by_provider_id(upsert.customer.id, provider_id)
                .await?
            {
                return Ok(InboundResolution::Redelivered {
                    customer: upsert.customer,
                    message,
                });
            }
        }

        self.active_ticket(identity, upsert)
            .await
            .map(InboundResolution::Resolved)
    }

    /// Reuse, open or reopen the customer's ticket. Callers hold the identity lock.
    async fn active_ticket(
        &self,
        identity: &Identity,
        upsert: CustomerUpsert,
    ) -> Result<Resolution, StoreError> {
        let customer = upsert.customer;

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let latest = self.store.latest_ticket(customer.id, identity.channel).await?;

            let (sequence_number, metadata, reopened) = match &latest {
                Some(ticket) if ticket.status.is_active() => {
                    return Ok(Resolution {
                        customer,
                        ticket: ticket.clone(),
                        created: false,
                        reopened: false,
                        customer_created: upsert.inserted,
                    });
                }
                Some(previous) => (
                    previous.sequence_number + 1,
                    serde_json::json!({ "previous_ticket_id": previous.id }),
                    true,
                ),
                None => (1, serde_json::json!({}), false),
            };

            let created = self
                .store
                .create_ticket(NewTicket {
                    customer_id: customer.id,
                    channel: identity.channel,
                    sequence_number,
                    metadata,
                })
                .await;

            match created {
                Ok(ticket) => {
                    tracing::info!(
                        ticket_id = %ticket.id,
                        customer_id = %customer.id,
                        sequence_number = ticket.sequence_number,
                        reopened,
                        "Opened ticket"
                    );
                    return Ok(Resolution {
                        customer,
                        ticket,
                        created: true,
                        reopened,
                        customer_created: upsert.inserted,
                    });
                }
                Err(StoreError::Conflict(reason)) => {
                    // Another process created the ticket between our read and write.
                    tracing::warn!(
                        customer_id = %customer.id,
                        attempt,
                        reason = %reason,
                        "Ticket creation lost a race, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(
            customer_id = %customer.id,
            external_id = %identity.external_id,
            "Could not converge on a single active ticket; concurrency invariant violated"
        );
        Err(StoreError::Conflict(format!(
            "no stable active ticket for customer {}",
            customer.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use relaydesk_shared::TicketStatus;
    use std::collections::HashSet;

    fn identity(number: &str) -> Identity {
        Identity {
            channel: Channel::Whatsapp,
            external_id: number.to_string(),
            display_name: Some("Ana".to_string()),
        }
    }

    fn resolver() -> (Arc<MemoryStore>, SessionResolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = SessionResolver::new(store.clone(), store.clone());
        (store, resolver)
    }

    #[tokio::test]
    async fn test_first_contact_creates_ticket() {
        let (_store, resolver) = resolver();
        let res = resolver.resolve(&identity("+5511999998888"), Some("Ana")).await.unwrap();

        assert!(res.created);
        assert!(!res.reopened);
        assert!(res.customer_created);
        assert_eq!(res.ticket.sequence_number, 1);
        assert_eq!(res.ticket.status, TicketStatus::Open);
        assert_eq!(res.customer.display_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_open_ticket_is_reused() {
        let (_store, resolver) = resolver();
        let first = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();
        let second = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();

        assert_eq!(first.ticket.id, second.ticket.id);
        assert!(!second.created);
        assert!(!second.reopened);
        assert!(!second.customer_created);
    }

    #[tokio::test]
    async fn test_in_progress_ticket_is_reused() {
        let (store, resolver) = resolver();
        let first = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();
        store
            .update_ticket_status(first.ticket.id, TicketStatus::InProgress)
            .await
            .unwrap();

        let second = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();
        assert_eq!(second.ticket.id, first.ticket.id);
        assert_eq!(second.ticket.status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn test_closed_ticket_reopens_with_next_sequence() {
        let (store, resolver) = resolver();
        let first = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();
        store
            .update_ticket_status(first.ticket.id, TicketStatus::Closed)
            .await
            .unwrap();

        let second = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();
        assert!(second.created);
        assert!(second.reopened);
        assert_ne!(second.ticket.id, first.ticket.id);
        assert_eq!(second.ticket.sequence_number, 2);
        assert_eq!(second.ticket.status, TicketStatus::Open);
        assert_eq!(
            second.ticket.metadata["previous_ticket_id"],
            serde_json::json!(first.ticket.id)
        );

        store
            .update_ticket_status(second.ticket.id, TicketStatus::Cancelled)
            .await
            .unwrap();
        let third = resolver.resolve(&identity("+5511999998888"), None).await.unwrap();
        assert_eq!(third.ticket.sequence_number, 3);
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_create_one_ticket() {
        let (store, resolver) = resolver();
        let resolver = Arc::new(resolver);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let resolver = Arc::clone(&resolver);
            tasks.push(tokio::spawn(async move {
                resolver
                    .resolve(&identity("+5511999998888"), Some("Ana"))
                    .await
                    .unwrap()
            }));
        }

        let mut ticket_ids = HashSet::new();
        let mut created = 0;
        for task in tasks {
            let res = task.await.unwrap();
            ticket_ids.insert(res.ticket.id);
            if res.created {
                created += 1;
            }
        }

        assert_eq!(ticket_ids.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(store.ticket_count(), 1);
    }

    #[tokio::test]
    async fn test_display_name_refresh() {
        let (_store, resolver) = resolver();
        resolver.resolve(&identity("+5511999998888"), Some("Ana")).await.unwrap();
        let res = resolver
            .resolve(&identity("+5511999998888"), Some("Ana Paula"))
            .await
            .unwrap();
        assert_eq!(res.customer.display_name.as_deref(), Some("Ana Paula"));
    }

    #[tokio::test]
    async fn test_store_outage_fails_resolution() {
        let (store, resolver) = resolver();
        store.set_unavailable(true);
        let err = resolver
            .resolve(&identity("+5511999998888"), None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
