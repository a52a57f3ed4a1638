//! Duplicate suppression.
//!
//! Two independent guards:
//!
//! - [`InboundDedup`] rejects client retries, keyed by the client-supplied
//!   message id, plus identical text from the same identity inside a short
//!   trailing window.
//! - [`DeliveryTracker`] remembers which message ids each polling consumer
//!   already received so a repeated poll with a stale watermark comes back
//!   empty.
//!
//! Both are process-local and bounded. Losing them (restart) only lets more
//! duplicates through.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    clock::Clock,
    config::{DedupConfig, DeliveryConfig},
    types::Message,
};

#[derive(Debug, Default)]
struct RecencySet {
    members: HashSet<String>,
    order: VecDeque<String>,
}

impl RecencySet {
    fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    fn insert(&mut self, key: &str) -> bool {
        if !self.members.insert(key.to_string()) {
            return false;
        }
        self.order.push_back(key.to_string());
        true
    }

    fn remove(&mut self, key: &str) {
        if self.members.remove(key) {
            self.order.retain(|k| k != key);
        }
    }

    fn evict_oldest(&mut self, count: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        for _ in 0..count {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.members.remove(&oldest);
                    evicted.push(oldest);
                }
                None => break,
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

// Accepted client ids, plus the stored id for those that turned out to repeat
// an earlier message.
#[derive(Debug, Default)]
struct AcceptedTokens {
    seen: RecencySet,
    canonical: HashMap<String, String>,
}

pub struct InboundDedup {
    clock: Arc<dyn Clock>,
    accepted: Mutex<AcceptedTokens>,
    capacity: usize,
    text_window_ms: i64,
}

impl InboundDedup {
    pub fn new(clock: Arc<dyn Clock>, config: &DedupConfig) -> Self {
        Self {
            clock,
            accepted: Mutex::new(AcceptedTokens::default()),
            capacity: config.token_capacity.max(1),
            text_window_ms: config.text_window_ms,
        }
    }

    /// Records `client_message_id` and reports whether it was already seen.
    ///
    /// Past the capacity ceiling the oldest tenth of the set is evicted.
    pub fn check_and_remember(&self, client_message_id: &str) -> bool {
        let mut accepted = self.accepted.lock();
        if accepted.seen.contains(client_message_id) {
            return true;
        }
        accepted.seen.insert(client_message_id);
        if accepted.seen.len() > self.capacity {
            let batch = (self.capacity / 10).max(1);
            for evicted in accepted.seen.evict_oldest(batch) {
                accepted.canonical.remove(&evicted);
            }
        }
        false
    }

    /// Records that `client_message_id` was folded into the stored message
    /// `message_id`, so a retry of it reports the stored id.
    pub fn alias(&self, client_message_id: &str, message_id: &str) {
        let mut accepted = self.accepted.lock();
        if accepted.seen.contains(client_message_id) && client_message_id != message_id {
            accepted
                .canonical
                .insert(client_message_id.to_string(), message_id.to_string());
        }
    }

    /// The stored message id a remembered client id stands for.
    pub fn canonical_id(&self, client_message_id: &str) -> String {
        self.accepted
            .lock()
            .canonical
            .get(client_message_id)
            .cloned()
            .unwrap_or_else(|| client_message_id.to_string())
    }

    /// Releases a token whose message never made it into the store, so the
    /// client's retry is accepted.
    pub fn forget(&self, client_message_id: &str) {
        let mut accepted = self.accepted.lock();
        accepted.seen.remove(client_message_id);
        accepted.canonical.remove(client_message_id);
    }

    /// Finds a message in `recent` with identical text sent inside the window.
    pub fn find_repeat<'a>(&self, recent: &'a [Message], text: &str) -> Option<&'a Message> {
        if self.text_window_ms <= 0 {
            return None;
        }
        let now = self.clock.now_millis();
        recent
            .iter()
            .find(|m| m.text == text && now - m.sent_at < self.text_window_ms)
    }

    pub fn tracked(&self) -> usize {
        self.accepted.lock().seen.len()
    }
}

/// Who is polling. The operator console and the visitor keep separate
/// delivered-sets even when they read the same conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Consumer {
    Widget(String),
    Operator(String),
}

impl Consumer {
    pub fn identity_id(&self) -> &str {
        match self {
            Consumer::Widget(id) | Consumer::Operator(id) => id,
        }
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consumer::Widget(id) => write!(f, "widget:{id}"),
            Consumer::Operator(id) => write!(f, "operator:{id}"),
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerState {
    delivered: RecencySet,
    last_poll_at: i64,
}

pub struct DeliveryTracker {
    clock: Arc<dyn Clock>,
    consumers: Mutex<HashMap<Consumer, ConsumerState>>,
    capacity: usize,
    idle_ms: i64,
    sweep_probability: f64,
}

impl DeliveryTracker {
    pub fn new(clock: Arc<dyn Clock>, config: &DeliveryConfig) -> Self {
        Self {
            clock,
            consumers: Mutex::new(HashMap::new()),
            capacity: config.capacity.max(1),
            idle_ms: config.idle_ms,
            sweep_probability: config.sweep_probability,
        }
    }

    /// Drops messages `consumer` already received and marks the rest delivered.
    pub fn filter_undelivered(&self, consumer: &Consumer, batch: Vec<Message>) -> Vec<Message> {
        let now = self.clock.now_millis();
        let fresh = {
            let mut consumers = self.consumers.lock();
            let state = consumers.entry(consumer.clone()).or_default();
            state.last_poll_at = now;

            let fresh = batch
                .into_iter()
                .filter(|m| state.delivered.insert(&m.id))
                .collect::<Vec<_>>();
            let overflow = state.delivered.len().saturating_sub(self.capacity);
            state.delivered.evict_oldest(overflow);
            fresh
        };

        if rand::random::<f64>() < self.sweep_probability {
            self.sweep_idle();
        }
        fresh
    }

    /// Forgets consumers that have not polled within the idle window.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let mut consumers = self.consumers.lock();
        let before = consumers.len();
        consumers.retain(|_, state| now - state.last_poll_at <= self.idle_ms);
        let dropped = before - consumers.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped idle poll consumers");
        }
        dropped
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }
}
