//! Client-side link supervision
//!
//! Agent consoles and other real-time clients keep one link to the hub. When
//! it drops, they back off exponentially with jitter, reconnect, and rejoin
//! every ticket they had open, passing the cursor of the last message seen so
//! the hub replays exactly what was missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relaydesk_shared::{Message, MessageCursor};
use tokio::sync::watch;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

use crate::websocket::ClientEvent;

/// Observable state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before attempt number `attempt`
    Backoff { attempt: usize, delay: Duration },
}

/// Failures of a link or connection attempt
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Why [`Reconnector::run`] returned
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    #[error("gave up after {attempts} failed attempts")]
    GaveUp { attempts: usize },
}

/// A live connection to the hub
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, event: ClientEvent) -> Result<(), LinkError>;

    /// Resolves when the link drops.
    async fn closed(&mut self);
}

/// Opens links to the hub
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Link>, LinkError>;
}

/// Backoff settings
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First retry delay before jitter
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated; `None` retries forever
    pub max_attempts: Option<usize>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delays between consecutive failed attempts: base, 2*base, 4*base, ... capped at `max_delay`.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay);
        let jittered: Box<dyn Iterator<Item = Duration> + Send> = if self.jitter {
            Box::new(strategy.map(jitter))
        } else {
            Box::new(strategy)
        };
        match self.max_attempts {
            Some(limit) => Box::new(jittered.take(limit)),
            None => jittered,
        }
    }
}

/// Tickets the client has joined and how far it has read each one
#[derive(Debug, Default, Clone)]
pub struct ResumeState {
    tickets: HashMap<Uuid, Option<MessageCursor>>,
}

impl ResumeState {
    pub fn joined(&mut self, ticket_id: Uuid) {
        self.tickets.entry(ticket_id).or_insert(None);
    }

    pub fn left(&mut self, ticket_id: Uuid) {
        self.tickets.remove(&ticket_id);
    }

    /// Record a delivered message. Returns false for one already seen.
    pub fn observe(&mut self, message: &Message) -> bool {
        let Some(cursor) = self.tickets.get_mut(&message.ticket_id) else {
            return false;
        };
        match cursor {
            Some(seen) if !seen.precedes(message) => false,
            _ => {
                *cursor = Some(message.cursor());
                true
            }
        }
    }

    pub fn cursor(&self, ticket_id: &Uuid) -> Option<MessageCursor> {
        self.tickets.get(ticket_id).copied().flatten()
    }

    /// Join events replaying what each ticket missed.
    pub fn rejoin_events(&self) -> Vec<ClientEvent> {
        let mut events: Vec<ClientEvent> = self
            .tickets
            .iter()
            .map(|(ticket_id, after)| ClientEvent::JoinTicket {
                ticket_id: *ticket_id,
                user_id: None,
                after: *after,
            })
            .collect();
        events.sort_by_key(|event| match event {
            ClientEvent::JoinTicket { ticket_id, .. } => *ticket_id,
            _ => Uuid::nil(),
        });
        events
    }
}

/// Keeps a link up and restores subscriptions after every reconnect
pub struct Reconnector {
    policy: ReconnectPolicy,
    state_tx: watch::Sender<LinkState>,
    resume: Arc<Mutex<ResumeState>>,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            policy,
            state_tx,
            resume: Arc::new(Mutex::new(ResumeState::default())),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Shared resume bookkeeping; the client updates it as events arrive.
    pub fn resume_state(&self) -> Arc<Mutex<ResumeState>> {
        Arc::clone(&self.resume)
    }

    fn set_state(&self, state: LinkState) {
        tracing::debug!(?state, "Link state changed");
        self.state_tx.send_replace(state);
    }

    /// Supervise the link until `shutdown` flips to true or attempts run out.
    pub async fn run(
        &self,
        connector: &dyn Connector,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReconnectError> {
        let mut delays = self.policy.delays();
        let mut failures = 0usize;

        loop {
            if *shutdown.borrow() {
                self.set_state(LinkState::Disconnected);
                return Ok(());
            }

            self.set_state(LinkState::Connecting);
            match connector.connect().await {
                Ok(mut link) => {
                    failures = 0;
                    delays = self.policy.delays();
                    self.set_state(LinkState::Connected);

                    let rejoin = self
                        .resume
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .rejoin_events();
                    let mut healthy = true;
                    for event in rejoin {
                        if let Err(e) = link.send(event).await {
                            tracing::warn!(error = %e, "Rejoin failed");
                            healthy = false;
                            break;
                        }
                    }

                    if healthy {
                        tokio::select! {
                            _ = link.closed() => {
                                tracing::info!("Link dropped");
                            }
                            _ = stopped(&mut shutdown) => {
                                self.set_state(LinkState::Disconnected);
                                return Ok(());
                            }
                        }
                    }
                    self.set_state(LinkState::Disconnected);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, attempt = failures, "Connect attempt failed");
                }
            }

            let Some(delay) = delays.next() else {
                self.set_state(LinkState::Disconnected);
                return Err(ReconnectError::GaveUp { attempts: failures });
            };
            self.set_state(LinkState::Backoff {
                attempt: failures + 1,
                delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => {
                    self.set_state(LinkState::Disconnected);
                    return Ok(());
                }
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydesk_shared::Direction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    fn message(ticket_id: Uuid, seq: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            seq,
            ticket_id,
            provider_message_id: None,
            direction: Direction::Inbound,
            sender_ref: "+5511999998888".to_string(),
            body: format!("m{seq}"),
            provider_timestamp: None,
            created_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        }
    }

    fn fast_policy(max_attempts: Option<usize>) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(8),
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let delays: Vec<u128> = ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            max_attempts: Some(6),
            jitter: false,
        }
        .delays()
        .map(|d| d.as_millis())
        .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = ReconnectPolicy {
            max_attempts: Some(20),
            ..ReconnectPolicy::default()
        };
        assert!(policy.delays().all(|d| d <= policy.max_delay));
    }

    #[test]
    fn test_resume_state_tracks_cursor_and_dedups() {
        let ticket = Uuid::new_v4();
        let mut resume = ResumeState::default();
        assert!(!resume.observe(&message(ticket, 1)), "unjoined tickets are ignored");

        resume.joined(ticket);
        assert!(resume.observe(&message(ticket, 1)));
        assert!(resume.observe(&message(ticket, 2)));
        assert!(!resume.observe(&message(ticket, 2)));
        assert!(!resume.observe(&message(ticket, 1)));
        assert_eq!(resume.cursor(&ticket).map(|c| c.seq), Some(2));

        match resume.rejoin_events().as_slice() {
            [ClientEvent::JoinTicket { ticket_id, after, .. }] => {
                assert_eq!(*ticket_id, ticket);
                assert_eq!(after.map(|c| c.seq), Some(2));
            }
            other => panic!("Expected one join, got {other:?}"),
        }

        resume.left(ticket);
        assert!(resume.rejoin_events().is_empty());
    }

    struct ScriptedLink {
        sent: mpsc::UnboundedSender<ClientEvent>,
    }

    #[async_trait]
    impl Link for ScriptedLink {
        async fn send(&mut self, event: ClientEvent) -> Result<(), LinkError> {
            self.sent
                .send(event)
                .map_err(|e| LinkError::Send(e.to_string()))
        }

        async fn closed(&mut self) {
            // Drop immediately after the rejoin burst.
        }
    }

    /// Fails `failures` times, then hands out links that drop at once.
    struct FlakyConnector {
        failures: usize,
        attempts: AtomicUsize,
        sent: mpsc::UnboundedSender<ClientEvent>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> Result<Box<dyn Link>, LinkError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(LinkError::Connect("refused".to_string()));
            }
            Ok(Box::new(ScriptedLink {
                sent: self.sent.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (sent, _rx) = mpsc::unbounded_channel();
        let connector = FlakyConnector {
            failures: usize::MAX,
            attempts: AtomicUsize::new(0),
            sent,
        };
        let reconnector = Reconnector::new(fast_policy(Some(3)));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = reconnector.run(&connector, stop_rx).await;
        assert_eq!(result, Err(ReconnectError::GaveUp { attempts: 4 }));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(reconnector.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_with_cursor() {
        let ticket = Uuid::new_v4();
        let (sent, mut rx) = mpsc::unbounded_channel();
        let connector = FlakyConnector {
            failures: 2,
            attempts: AtomicUsize::new(0),
            sent,
        };
        let reconnector = Arc::new(Reconnector::new(fast_policy(None)));
        {
            let resume = reconnector.resume_state();
            let mut resume = resume.lock().unwrap();
            resume.joined(ticket);
            resume.observe(&message(ticket, 7));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut states = reconnector.subscribe_state();
        let runner = {
            let reconnector = Arc::clone(&reconnector);
            tokio::spawn(async move { reconnector.run(&connector, stop_rx).await })
        };

        let join = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match join {
            ClientEvent::JoinTicket { ticket_id, after, .. } => {
                assert_eq!(ticket_id, ticket);
                assert_eq!(after.map(|c| c.seq), Some(7));
            }
            other => panic!("Expected join, got {other:?}"),
        }

        // The link keeps dropping, so the supervisor keeps cycling.
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| matches!(s, LinkState::Backoff { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        stop_tx.send_replace(true);
        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(reconnector.state(), LinkState::Disconnected);
    }
}
