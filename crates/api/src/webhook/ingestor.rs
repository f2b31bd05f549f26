//! Webhook ingestion pipeline
//!
//! One provider event becomes at most one stored message:
//! classify, extract the sender, resolve its ticket, append, publish.
//! Terminal failures are acknowledged as ignored; transient store failures ask the
//! provider to redeliver, which dedup makes safe.

use std::sync::Arc;

use relaydesk_shared::{Direction, NewMessage, StoreError};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::identity::IdentityExtractor;
use super::payload::{MessageUpsert, ProviderEvent};
use crate::session::{InboundResolution, SessionResolver};
use crate::websocket::ConnectionHub;

/// Outcome of one webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestResult {
    /// The message is stored (possibly by an earlier delivery)
    Accepted {
        ticket_id: Uuid,
        message_id: Uuid,
        ticket_created: bool,
        reopened: bool,
        customer_created: bool,
        duplicate: bool,
    },
    /// Nothing to store; redelivery would not change that
    Ignored { reason: String },
    /// Transient failure; the provider should redeliver
    Retry { error: String },
}

impl IngestResult {
    fn ignored(reason: impl Into<String>) -> Self {
        IngestResult::Ignored {
            reason: reason.into(),
        }
    }

    /// Redeliver only when a later attempt can succeed.
    ///
    /// A ticket closed between resolve and append resolves to a fresh ticket
    /// on redelivery; malformed rows or vanished tickets never will.
    fn from_store_error(error: &StoreError) -> Self {
        if error.is_transient() || matches!(error, StoreError::TicketClosed(_)) {
            IngestResult::Retry {
                error: error.to_string(),
            }
        } else {
            IngestResult::ignored("store_rejected")
        }
    }
}

/// Runs provider events through extraction, resolution and storage
pub struct WebhookIngestor {
    extractor: IdentityExtractor,
    resolver: Arc<SessionResolver>,
    hub: ConnectionHub,
}

impl WebhookIngestor {
    pub fn new(extractor: IdentityExtractor, resolver: Arc<SessionResolver>, hub: ConnectionHub) -> Self {
        Self {
            extractor,
            resolver,
            hub,
        }
    }

    /// Process one raw webhook body.
    pub async fn handle(&self, raw: Value) -> IngestResult {
        match ProviderEvent::from_value(raw) {
            ProviderEvent::MessageUpsert(upsert) => self.handle_message(upsert).await,
            ProviderEvent::ConnectionUpdate { instance, state } => {
                tracing::info!(
                    instance = instance.as_deref().unwrap_or("-"),
                    state = state.as_deref().unwrap_or("unknown"),
                    "Provider connection state changed"
                );
                IngestResult::ignored("connection_update")
            }
            ProviderEvent::Unrecognized { event } => {
                tracing::debug!(event = %event, "Ignoring unsupported webhook event");
                IngestResult::ignored("unsupported_event")
            }
        }
    }

    async fn handle_message(&self, upsert: MessageUpsert) -> IngestResult {
        let data = upsert.data;

        // Our own replies echo back without the id we stored them under.
        if data.key.from_me {
            tracing::debug!(
                provider_message_id = data.key.id.as_deref().unwrap_or("-"),
                "Ignoring outbound echo"
            );
            return IngestResult::ignored("from_me");
        }

        let (identity, source) = match self.extractor.extract_from_message(&data) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    instance = upsert.instance.as_deref().unwrap_or("-"),
                    remote_jid = data.key.remote_jid.as_deref().unwrap_or("-"),
                    reason = e.reason(),
                    "Webhook without a usable sender identity"
                );
                return IngestResult::ignored(e.reason());
            }
        };

        let resolved = self
            .resolver
            .resolve_inbound(
                &identity,
                identity.display_name.as_deref(),
                data.key.id.as_deref(),
            )
            .await;
        let resolution = match resolved {
            Ok(InboundResolution::Resolved(resolution)) => resolution,
            Ok(InboundResolution::Redelivered { customer, message }) => {
                tracing::info!(
                    ticket_id = %message.ticket_id,
                    message_id = %message.id,
                    customer_id = %customer.id,
                    "Redelivered message already stored"
                );
                return IngestResult::Accepted {
                    ticket_id: message.ticket_id,
                    message_id: message.id,
                    ticket_created: false,
                    reopened: false,
                    customer_created: false,
                    duplicate: true,
                };
            }
            Err(e) => {
                tracing::error!(
                    external_id = %identity.external_id,
                    error = %e,
                    "Session resolution failed"
                );
                return IngestResult::from_store_error(&e);
            }
        };

        let ticket_id = resolution.ticket.id;
        let appended = self
            .hub
            .append_and_publish(NewMessage {
                ticket_id,
                provider_message_id: data.key.id.clone(),
                direction: Direction::Inbound,
                sender_ref: identity.external_id.clone(),
                body: data.text_body(),
                provider_timestamp: data.timestamp(),
            })
            .await;

        match appended {
            Ok(appended) => {
                tracing::info!(
                    ticket_id = %ticket_id,
                    message_id = %appended.message.id,
                    external_id = %identity.external_id,
                    identity_source = ?source,
                    duplicate = appended.duplicate,
                    ticket_created = resolution.created,
                    "Inbound message stored"
                );
                IngestResult::Accepted {
                    ticket_id,
                    message_id: appended.message.id,
                    ticket_created: resolution.created,
                    reopened: resolution.reopened,
                    customer_created: resolution.customer_created,
                    duplicate: appended.duplicate,
                }
            }
            Err(e) => {
                tracing::warn!(
                    ticket_id = %ticket_id,
                    error = %e,
                    "Message append failed"
                );
                IngestResult::from_store_error(&e)
            }
        }
    }
}
