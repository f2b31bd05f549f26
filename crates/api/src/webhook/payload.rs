//! Provider webhook payload shapes
//!
//! The provider changes field layout between versions, so the raw JSON is
//! classified into a small set of known shapes with a catch-all
//! [`ProviderEvent::Unrecognized`] variant. Unknown fields are ignored.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Fields common to every provider callback
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    instance: Option<String>,
    #[serde(default)]
    data: Value,
}

/// A classified provider event
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A message was received (or echoed back after we sent it)
    MessageUpsert(MessageUpsert),
    /// The provider's own session with WhatsApp changed state
    ConnectionUpdate {
        instance: Option<String>,
        state: Option<String>,
    },
    /// Anything else, including known events whose payload did not parse
    Unrecognized { event: String },
}

impl ProviderEvent {
    /// Classify a raw webhook body.
    pub fn from_value(raw: Value) -> Self {
        let envelope: Envelope = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Webhook body is not an event envelope");
                return ProviderEvent::Unrecognized {
                    event: String::new(),
                };
            }
        };

        match normalize_event_name(&envelope.event).as_str() {
            "messages.upsert" => match serde_json::from_value::<MessageData>(envelope.data) {
                Ok(data) => ProviderEvent::MessageUpsert(MessageUpsert {
                    instance: envelope.instance,
                    data,
                }),
                Err(e) => {
                    tracing::warn!(
                        event = %envelope.event,
                        error = %e,
                        "Message event payload has an unknown shape"
                    );
                    ProviderEvent::Unrecognized {
                        event: envelope.event,
                    }
                }
            },
            "connection.update" => ProviderEvent::ConnectionUpdate {
                instance: envelope.instance,
                state: envelope
                    .data
                    .get("state")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            _ => ProviderEvent::Unrecognized {
                event: envelope.event,
            },
        }
    }

    /// Event name for logs.
    pub fn name(&self) -> &str {
        match self {
            ProviderEvent::MessageUpsert(_) => "messages.upsert",
            ProviderEvent::ConnectionUpdate { .. } => "connection.update",
            ProviderEvent::Unrecognized { event } => event,
        }
    }
}

/// `MESSAGES_UPSERT` and `messages.upsert` name the same event.
fn normalize_event_name(event: &str) -> String {
    event.trim().to_ascii_lowercase().replace('_', ".")
}

/// A `messages.upsert` event
#[derive(Debug, Clone)]
pub struct MessageUpsert {
    pub instance: Option<String>,
    pub data: MessageData,
}

/// The `data` object of a message event
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub message_type: Option<String>,
    /// Seconds since the epoch; number, numeric string or `{low, high}` long
    #[serde(default)]
    pub message_timestamp: Option<Value>,
    #[serde(default)]
    pub metadata: Option<PeerMetadata>,
}

/// Addressing block of a message
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    /// Phone-number JID sent alongside an `@lid` remote JID
    #[serde(default)]
    pub remote_jid_alt: Option<String>,
    /// Linked phone number of the sender
    #[serde(default)]
    pub sender_pn: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
}

/// Peer details some provider versions nest under `data.metadata`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerMetadata {
    #[serde(default, alias = "phoneNumber", alias = "wa_id", alias = "waId")]
    pub phone: Option<String>,
}

impl MessageData {
    /// Provider-side send time, when present and valid.
    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        let seconds = match self.message_timestamp.as_ref()? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            Value::Object(long) => {
                let low = long.get("low")?.as_i64()? & 0xffff_ffff;
                let high = long.get("high").and_then(Value::as_i64).unwrap_or(0);
                (high << 32) | low
            }
            _ => return None,
        };
        OffsetDateTime::from_unix_timestamp(seconds).ok()
    }

    /// Best-effort text of the message.
    ///
    /// Media and other content without text becomes a `[kind]` placeholder.
    pub fn text_body(&self) -> String {
        let Some(message) = self.message.as_ref() else {
            return placeholder(self.message_type.as_deref().unwrap_or("empty"));
        };

        let text = message
            .get("conversation")
            .and_then(Value::as_str)
            .or_else(|| message.pointer("/extendedTextMessage/text").and_then(Value::as_str))
            .or_else(|| {
                ["imageMessage", "videoMessage", "documentMessage"]
                    .iter()
                    .find_map(|kind| message.get(kind)?.get("caption")?.as_str())
            });

        match text {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => {
                let kind = self
                    .message_type
                    .as_deref()
                    .or_else(|| message.as_object()?.keys().next().map(String::as_str))
                    .unwrap_or("unknown");
                placeholder(kind)
            }
        }
    }
}

fn placeholder(kind: &str) -> String {
    format!("[{kind}]")
}
