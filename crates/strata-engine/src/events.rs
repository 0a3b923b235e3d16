//! Event Publisher: sequenced fan-out of analysis events to subscribers.
//!
//! Delivery is at-least-once. Every event carries the repository's event
//! sequence number; a [`Subscription`] classifies what it receives so a
//! consumer can tell a duplicate from a gap and resync on the latter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use strata_core::{AnalysisEvent, EventType};

use crate::aggregate::EVENT_RETENTION;

/// How a delivered event relates to what the subscriber saw before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The next expected event.
    InOrder,
    /// Already seen; safe to ignore.
    Duplicate,
    /// Events between `expected` and this one were missed.
    Gap {
        /// First missing sequence number.
        expected: u64,
    },
}

/// An event together with its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The event.
    pub event: AnalysisEvent,
    /// Relation to earlier deliveries.
    pub status: DeliveryStatus,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Sender<AnalysisEvent>>,
    replay: VecDeque<AnalysisEvent>,
    latest: HashMap<String, u64>,
}

/// Broadcasts events to every live subscriber and keeps a bounded replay
/// buffer.
///
/// # Examples
///
/// ```
/// use strata_core::{AnalysisEvent, EventPayload};
/// use strata_engine::{DeliveryStatus, EventPublisher};
///
/// let publisher = EventPublisher::default();
/// let mut sub = publisher.subscribe();
/// publisher.publish(AnalysisEvent::new("r", 1, EventPayload::CommitsAnalyzed {
///     shas: vec!["c1".into()],
///     changed_files: vec![],
///     rescored: vec![],
/// }));
/// assert_eq!(sub.try_recv().unwrap().status, DeliveryStatus::InOrder);
/// ```
pub struct EventPublisher {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(EVENT_RETENTION as usize)
    }
}

impl EventPublisher {
    /// Publisher that keeps up to `capacity` events for replay.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send `event` to every subscriber; disconnected ones are dropped.
    pub fn publish(&self, event: AnalysisEvent) {
        let mut inner = self.lock();

        let known = inner.replay.iter().any(|e| {
            e.repo_id == event.repo_id
                && e.sequence_number == event.sequence_number
                && e.event_type == event.event_type
        });
        if !known {
            if inner.replay.len() == self.capacity {
                inner.replay.pop_front();
            }
            inner.replay.push_back(event.clone());
        }
        if event.event_type != EventType::ScanFailed {
            let latest = inner.latest.entry(event.repo_id.clone()).or_insert(0);
            *latest = (*latest).max(event.sequence_number);
        }

        let before = inner.subscribers.len();
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        let dropped = before - inner.subscribers.len();
        tracing::debug!(
            repo = %event.repo_id,
            seq = event.sequence_number,
            kind = %event.event_type,
            subscribers = inner.subscribers.len(),
            dropped,
            "published event"
        );
    }

    /// New subscription receiving every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        self.lock().subscribers.push(tx);
        Subscription {
            receiver: rx,
            last_seen: HashMap::new(),
        }
    }

    /// Live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Highest sequence number published for `repo_id`.
    pub fn latest(&self, repo_id: &str) -> u64 {
        self.lock().latest.get(repo_id).copied().unwrap_or(0)
    }

    /// Buffered events of `repo_id` after sequence number `after`.
    ///
    /// Returns `None` when the buffer no longer reaches back to `after + 1`;
    /// the subscriber must then resync from the query surface.
    pub fn replay_since(&self, repo_id: &str, after: u64) -> Option<Vec<AnalysisEvent>> {
        let inner = self.lock();
        let latest = inner.latest.get(repo_id).copied().unwrap_or(0);
        if after >= latest {
            return Some(Vec::new());
        }
        let covered = inner.replay.iter().any(|e| {
            e.repo_id == repo_id
                && e.event_type != EventType::ScanFailed
                && e.sequence_number == after + 1
        });
        if !covered {
            return None;
        }
        Some(
            inner
                .replay
                .iter()
                .filter(|e| e.repo_id == repo_id && e.sequence_number > after)
                .cloned()
                .collect(),
        )
    }
}

/// Receiving end of an [`EventPublisher`].
pub struct Subscription {
    receiver: Receiver<AnalysisEvent>,
    last_seen: HashMap<String, u64>,
}

impl Subscription {
    /// Block until the next event; `None` once the publisher is gone.
    pub fn recv(&mut self) -> Option<Delivery> {
        let event = self.receiver.recv().ok()?;
        Some(self.classify(event))
    }

    /// Wait at most `timeout` for the next event.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(self.classify(event)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.receiver.try_recv() {
            Ok(event) => Some(self.classify(event)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Highest sequence number seen for `repo_id`.
    pub fn last_seen(&self, repo_id: &str) -> u64 {
        self.last_seen.get(repo_id).copied().unwrap_or(0)
    }

    /// Record that the consumer resynced `repo_id` up to `sequence`.
    pub fn resynced(&mut self, repo_id: &str, sequence: u64) {
        self.last_seen.insert(repo_id.to_string(), sequence);
    }

    /// Classify `event` against the events seen so far.
    ///
    /// `ScanFailed` carries the last committed sequence number without
    /// consuming one, so it is in order unless it reveals missed events.
    pub fn classify(&mut self, event: AnalysisEvent) -> Delivery {
        let last = self.last_seen(&event.repo_id);
        let seq = event.sequence_number;
        let status = if event.event_type == EventType::ScanFailed {
            if seq <= last {
                DeliveryStatus::InOrder
            } else {
                DeliveryStatus::Gap { expected: last + 1 }
            }
        } else if seq <= last {
            DeliveryStatus::Duplicate
        } else if seq == last + 1 {
            DeliveryStatus::InOrder
        } else {
            DeliveryStatus::Gap { expected: last + 1 }
        };
        if seq > last {
            self.last_seen.insert(event.repo_id.clone(), seq);
        }
        if let DeliveryStatus::Gap { expected } = status {
            tracing::warn!(repo = %event.repo_id, expected, got = seq, "event gap detected");
        }
        Delivery { event, status }
    }
}
