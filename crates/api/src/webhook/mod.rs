//! Inbound provider webhooks
//!
//! - **payload**: tolerant classification of raw provider JSON
//! - **identity**: sender extraction and phone normalization
//! - **ingestor**: per-event pipeline from payload to stored, published message

mod identity;
mod ingestor;
mod payload;

pub use identity::{ExtractionError, Identity, IdentityExtractor, IdentitySource};
pub use ingestor::{IngestResult, WebhookIngestor};
pub use payload::{MessageData, MessageKey, MessageUpsert, PeerMetadata, ProviderEvent};
