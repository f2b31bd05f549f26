//! Shared application state

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::outbound::{HttpSender, LogSender, OutboundSender};
use crate::session::SessionResolver;
use crate::store::{MemoryStore, MessageStore, PgStore, SessionStore};
use crate::webhook::{IdentityExtractor, WebhookIngestor};
use crate::websocket::{ConnectionHub, PresenceTracker};

/// State handed to every route handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<dyn SessionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub extractor: IdentityExtractor,
    pub resolver: Arc<SessionResolver>,
    pub ingestor: Arc<WebhookIngestor>,
    pub hub: ConnectionHub,
    pub presence: PresenceTracker,
    pub outbound: Arc<dyn OutboundSender>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the pipeline around one store implementing both store traits.
    pub fn with_store<S>(config: Config, store: Arc<S>, outbound: Arc<dyn OutboundSender>) -> Self
    where
        S: SessionStore + MessageStore,
    {
        let sessions: Arc<dyn SessionStore> = store.clone();
        let messages: Arc<dyn MessageStore> = store;

        let extractor = IdentityExtractor::new(config.default_country_code.clone());
        let hub = ConnectionHub::new(Arc::clone(&messages), config.hub());
        let presence = PresenceTracker::new(hub.clone(), config.typing_ttl);
        let resolver = Arc::new(SessionResolver::new(
            Arc::clone(&sessions),
            Arc::clone(&messages),
        ));
        let ingestor = Arc::new(WebhookIngestor::new(
            extractor.clone(),
            Arc::clone(&resolver),
            hub.clone(),
        ));

        Self {
            config: Arc::new(config),
            sessions,
            messages,
            extractor,
            resolver,
            ingestor,
            hub,
            presence,
            outbound,
            started_at: Instant::now(),
        }
    }

    /// Build state from configuration, connecting to Postgres when configured.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let outbound: Arc<dyn OutboundSender> = match config.provider() {
            Some(provider) => {
                tracing::info!(instance = %provider.instance, "Outbound provider configured");
                Arc::new(HttpSender::new(provider)?)
            }
            None => {
                tracing::warn!("Provider settings incomplete; agent replies will only be logged");
                Arc::new(LogSender)
            }
        };

        match config.database_url.clone() {
            Some(url) => {
                let pool =
                    relaydesk_shared::db::create_pool(&url, config.database_max_connections).await?;
                relaydesk_shared::db::run_migrations(&pool).await?;
                tracing::info!("Using PostgreSQL store");
                Ok(Self::with_store(config, Arc::new(PgStore::new(pool)), outbound))
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory store");
                Ok(Self::with_store(config, Arc::new(MemoryStore::new()), outbound))
            }
        }
    }

    /// Start the heartbeat monitor and typing sweeper.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.hub.spawn_heartbeat_monitor(),
            self.presence.spawn_sweeper(),
        ]
    }
}
