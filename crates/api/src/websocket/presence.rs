//! Typing indicators
//!
//! Typing state is ephemeral and never persisted. An entry expires `ttl`
//! after its last refresh; expiry is applied lazily on read and by a
//! periodic sweep, and every transition is broadcast to the ticket room.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::ServerEvent;
use super::hub::ConnectionHub;

#[derive(Debug, Clone)]
struct TypingEntry {
    user_name: String,
    expires_at: Instant,
}

/// An agent currently typing in a ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub user_name: String,
}

/// Tracks who is typing where
#[derive(Clone)]
pub struct PresenceTracker {
    hub: ConnectionHub,
    entries: Arc<Mutex<HashMap<(Uuid, Uuid), TypingEntry>>>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(hub: ConnectionHub, ttl: Duration) -> Self {
        Self {
            hub,
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(Uuid, Uuid), TypingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `user_id` as typing. Returns whether the state changed.
    ///
    /// Refreshing a live entry only extends its expiry.
    pub async fn start_typing(&self, ticket_id: Uuid, user_id: Uuid, user_name: &str) -> bool {
        let now = Instant::now();
        let started = {
            let mut entries = self.entries();
            let entry = TypingEntry {
                user_name: user_name.to_string(),
                expires_at: now + self.ttl,
            };
            match entries.insert((ticket_id, user_id), entry) {
                Some(previous) => previous.expires_at <= now,
                None => true,
            }
        };

        if started {
            tracing::debug!(ticket_id = %ticket_id, user_id = %user_id, "Typing started");
            self.hub
                .publish(
                    ticket_id,
                    ServerEvent::TypingStart {
                        ticket_id,
                        user_id,
                        user_name: user_name.to_string(),
                    },
                )
                .await;
        }
        started
    }

    /// Clear `user_id`'s typing state. Returns whether anything was cleared.
    pub async fn stop_typing(&self, ticket_id: Uuid, user_id: Uuid) -> bool {
        let removed = self.entries().remove(&(ticket_id, user_id));
        match removed {
            Some(entry) => {
                self.publish_stop(ticket_id, user_id, entry.user_name).await;
                true
            }
            None => false,
        }
    }

    /// Agents typing in `ticket_id`, with expired entries cleared first.
    pub async fn typing_users(&self, ticket_id: Uuid) -> Vec<TypingUser> {
        self.sweep(Instant::now()).await;
        let mut users: Vec<TypingUser> = self
            .entries()
            .iter()
            .filter(|((ticket, _), _)| *ticket == ticket_id)
            .map(|((_, user_id), entry)| TypingUser {
                user_id: *user_id,
                user_name: entry.user_name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        users
    }

    /// Expire entries whose TTL has passed at `now`; returns how many expired.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<((Uuid, Uuid), TypingEntry)> = {
            let mut entries = self.entries();
            let keys: Vec<(Uuid, Uuid)> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let count = expired.len();
        for ((ticket_id, user_id), entry) in expired {
            self.publish_stop(ticket_id, user_id, entry.user_name).await;
        }
        count
    }

    /// Drop a departing user's typing state in the tickets it had joined.
    pub async fn clear_user(&self, user_id: Uuid, tickets: &HashSet<Uuid>) {
        for ticket_id in tickets {
            self.stop_typing(*ticket_id, user_id).await;
        }
    }

    /// Periodically expire typing entries.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = (self.ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let expired = tracker.sweep(Instant::now()).await;
                if expired > 0 {
                    tracing::debug!(expired, "Expired typing indicators");
                }
            }
        })
    }

    async fn publish_stop(&self, ticket_id: Uuid, user_id: Uuid, user_name: String) {
        tracing::debug!(ticket_id = %ticket_id, user_id = %user_id, "Typing stopped");
        self.hub
            .publish(
                ticket_id,
                ServerEvent::TypingStop {
                    ticket_id,
                    user_id,
                    user_name,
                },
            )
            .await;
    }
}
