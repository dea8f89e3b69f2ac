//! Per-client retransmission of rare events.
//!
//! Events get a monotonically increasing id per client. They are resent at a
//! fixed interval until the client acknowledges them. The receiving side
//! applies each id once.

use log::warn;
use shared::GameEvent;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Unacknowledged events kept per client before the oldest are dropped.
pub const MAX_UNACKED_EVENTS: usize = 512;
/// Sends after which an unacknowledged event counts as stalled.
pub const STALLED_ATTEMPTS: u32 = 25;

#[derive(Debug, Clone)]
struct Pending {
    event: GameEvent,
    last_sent: Option<Instant>,
    attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ReliableOutbox {
    next_event_id: u64,
    unacked: BTreeMap<u64, Pending>,
}

impl Default for ReliableOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableOutbox {
    pub fn new() -> Self {
        Self {
            next_event_id: 1,
            unacked: BTreeMap::new(),
        }
    }

    /// Queues an event and returns its id.
    pub fn push(&mut self, event: GameEvent) -> u64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        self.unacked.insert(
            event_id,
            Pending {
                event,
                last_sent: None,
                attempts: 0,
            },
        );

        if self.unacked.len() > MAX_UNACKED_EVENTS {
            if let Some((dropped, _)) = self.unacked.pop_first() {
                warn!("Reliable outbox full, dropping event {}", dropped);
            }
        }
        event_id
    }

    /// Events never sent or not resent for `resend_interval`, oldest first.
    /// Marks them as sent at `now`.
    pub fn due(&mut self, now: Instant, resend_interval: Duration) -> Vec<(u64, GameEvent)> {
        self.unacked
            .iter_mut()
            .filter(|(_, pending)| match pending.last_sent {
                None => true,
                Some(sent) => now.saturating_duration_since(sent) >= resend_interval,
            })
            .map(|(id, pending)| {
                pending.last_sent = Some(now);
                pending.attempts += 1;
                if pending.attempts == STALLED_ATTEMPTS {
                    warn!("Event {} still unacknowledged after {} sends", id, pending.attempts);
                }
                (*id, pending.event.clone())
            })
            .collect()
    }

    pub fn ack(&mut self, event_ids: &[u64]) {
        for id in event_ids {
            self.unacked.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    /// Events sent at least [`STALLED_ATTEMPTS`] times without an ack.
    pub fn stalled(&self) -> usize {
        self.unacked
            .values()
            .filter(|pending| pending.attempts >= STALLED_ATTEMPTS)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }
}
