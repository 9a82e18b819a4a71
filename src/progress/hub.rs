//! Multicast of progress and lifecycle events to live subscribers
//!
//! Every subscriber owns a bounded sink plus the set of topics it asked
//! for. Publishing walks the sinks under one lock, so events reach a given
//! subscriber in publish order. A sink whose receiver is gone, or whose
//! buffer is full because its reader stopped reading, is dropped on the
//! spot; the evicted reader sees its stream end after the buffered events.
//! Nothing is buffered for absent subscribers: a client that reconnects must
//! take a snapshot instead of expecting a replay.

use futures::Stream;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::sample::{BundleProgress, SampleReport};
use crate::flow::{Bundle, PartSummary};

/// Events a subscriber may fall behind by before it is evicted
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// Named event channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Progress,
    Active,
    Completed,
    Failed,
    Paused,
    Resumed,
    Removed,
    Cancelled,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Progress,
        Topic::Active,
        Topic::Completed,
        Topic::Failed,
        Topic::Paused,
        Topic::Resumed,
        Topic::Removed,
        Topic::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Progress => "progress",
            Topic::Active => "active",
            Topic::Completed => "completed",
            Topic::Failed => "failed",
            Topic::Paused => "paused",
            Topic::Resumed => "resumed",
            Topic::Removed => "removed",
            Topic::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| format!("unknown topic '{}'", s))
    }
}

/// Event payload, serialized as-is into the pushed message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    Sample(SampleReport),
    Part(Box<PartSummary>),
    BundleProgress(BundleProgress),
    Bundle(Box<Bundle>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubEvent {
    pub topic: Topic,
    pub data: EventData,
}

impl HubEvent {
    pub fn part(topic: Topic, summary: PartSummary) -> Self {
        Self {
            topic,
            data: EventData::Part(Box::new(summary)),
        }
    }

    pub fn sample(report: SampleReport) -> Self {
        Self {
            topic: Topic::Progress,
            data: EventData::Sample(report),
        }
    }

    pub fn bundle_progress(progress: BundleProgress) -> Self {
        Self {
            topic: Topic::Progress,
            data: EventData::BundleProgress(progress),
        }
    }

    pub fn bundle(topic: Topic, bundle: Bundle) -> Self {
        Self {
            topic,
            data: EventData::Bundle(Box::new(bundle)),
        }
    }

    /// Id of the part or bundle the event is about
    pub fn subject_id(&self) -> crate::queue::JobId {
        match &self.data {
            EventData::Sample(report) => report.job_id,
            EventData::Part(summary) => summary.id,
            EventData::BundleProgress(progress) => progress.bundle_id,
            EventData::Bundle(bundle) => bundle.id,
        }
    }
}

struct Sink {
    /// Empty means every topic
    topics: HashSet<Topic>,
    tx: mpsc::Sender<HubEvent>,
}

impl Sink {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }
}

#[derive(Default)]
struct Sinks {
    next_id: u64,
    live: HashMap<u64, Sink>,
}

type SharedSinks = Arc<Mutex<Sinks>>;

fn lock(sinks: &SharedSinks) -> MutexGuard<'_, Sinks> {
    sinks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set of live subscriber sinks for one event family
#[derive(Clone)]
pub struct FanoutHub {
    name: &'static str,
    capacity: usize,
    sinks: SharedSinks,
}

impl FanoutHub {
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, DEFAULT_SINK_CAPACITY)
    }

    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            sinks: Arc::new(Mutex::new(Sinks::default())),
        }
    }

    /// Register a sink for `topics`; an empty slice subscribes to all
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut sinks = lock(&self.sinks);
        let id = sinks.next_id;
        sinks.next_id += 1;
        sinks.live.insert(
            id,
            Sink {
                topics: topics.iter().copied().collect(),
                tx,
            },
        );
        debug!(hub = self.name, subscriber = id, subscribers = sinks.live.len(), "Subscriber added");

        Subscription {
            id,
            rx,
            sinks: Arc::downgrade(&self.sinks),
        }
    }

    /// Push `event` to every sink interested in its topic
    ///
    /// Returns the number of sinks that accepted it.
    pub fn publish(&self, event: HubEvent) -> usize {
        let mut sinks = lock(&self.sinks);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, sink) in &sinks.live {
            if !sink.wants(event.topic) {
                continue;
            }
            match sink.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(hub = self.name, subscriber = *id, capacity = self.capacity, "Subscriber fell behind, evicting");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in dead {
            sinks.live.remove(&id);
            debug!(hub = self.name, subscriber = id, "Removed subscriber");
        }
        delivered
    }

    /// Idempotent; returns whether the subscriber was still registered
    pub fn unsubscribe(&self, id: u64) -> bool {
        lock(&self.sinks).live.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.sinks).live.len()
    }
}

/// Receiving end of a hub subscription; unsubscribes on drop
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<HubEvent>,
    sinks: Weak<Mutex<Sinks>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = HubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(sinks) = self.sinks.upgrade() {
            lock(&sinks).live.remove(&self.id);
        }
    }
}
