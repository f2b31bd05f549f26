//! Bounded per-connection outbound queue
//!
//! A slow reader must never stall the publisher. When the queue is full the
//! oldest pending event is dropped and the writer later tells the client how
//! many events it missed so it can re-request the ticket history.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{watch, Notify};

use super::events::ServerEvent;

/// What happened to a pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest pending event
    DroppedOldest,
    /// The queue is closed; the event was discarded
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<ServerEvent>,
    /// Drops not yet reported to the client
    unreported_drops: u64,
    total_drops: u64,
    closed: bool,
}

/// Drop-oldest FIFO feeding one socket writer
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    ready: Notify,
    closed_tx: watch::Sender<bool>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            ready: Notify::new(),
            closed_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, event: ServerEvent) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.events.len() >= self.capacity {
                state.events.pop_front();
                state.unreported_drops += 1;
                state.total_drops += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.events.push_back(event);
            outcome
        };
        self.ready.notify_one();
        outcome
    }

    /// Next event without waiting.
    ///
    /// A pending drop notice is delivered before the next queued event.
    pub fn try_recv(&self) -> Option<ServerEvent> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        if state.unreported_drops > 0 {
            let missed = std::mem::take(&mut state.unreported_drops);
            return Some(ServerEvent::error(format!(
                "Connection too slow: {missed} events were dropped; request messages again to resync"
            )));
        }
        state.events.pop_front()
    }

    /// Wait for the next event. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<ServerEvent> {
        loop {
            let notified = self.ready.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue; pending events are discarded and waiters wake up.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.events.clear();
        }
        self.closed_tx.send_replace(true);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.lock().total_drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pong(timestamp: i64) -> ServerEvent {
        ServerEvent::Pong { timestamp }
    }

    fn timestamp(event: ServerEvent) -> i64 {
        match event {
            ServerEvent::Pong { timestamp } => timestamp,
            other => panic!("Expected pong, got {other:?}"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        for i in 0..3 {
            assert_eq!(queue.push(pong(i)), PushOutcome::Queued);
        }
        assert_eq!(timestamp(queue.try_recv().unwrap()), 0);
        assert_eq!(timestamp(queue.try_recv().unwrap()), 1);
        assert_eq!(timestamp(queue.try_recv().unwrap()), 2);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports() {
        let queue = OutboundQueue::new(2);
        queue.push(pong(1));
        queue.push(pong(2));
        assert_eq!(queue.push(pong(3)), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_total(), 1);

        match queue.try_recv().unwrap() {
            ServerEvent::Error { message } => assert!(message.contains("1 events were dropped")),
            other => panic!("Expected drop notice, got {other:?}"),
        }
        assert_eq!(timestamp(queue.try_recv().unwrap()), 2);
        assert_eq!(timestamp(queue.try_recv().unwrap()), 3);
    }

    #[test]
    fn test_closed_queue_rejects_events() {
        let queue = OutboundQueue::new(2);
        queue.push(pong(1));
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.push(pong(2)), PushOutcome::Closed);
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_close() {
        let queue = Arc::new(OutboundQueue::new(4));

        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let first = queue.recv().await;
                let second = queue.recv().await;
                (first, second)
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(pong(7));
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let (first, second) = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(timestamp(first.unwrap()), 7);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let queue = Arc::new(OutboundQueue::new(1));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.closed().await })
        };
        queue.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
