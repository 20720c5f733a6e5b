//! Row change feed.
//!
//! In-process fan-out of row INSERT/UPDATE events to filtered subscribers.
//! Every store write publishes exactly one [`RowChange`]; delivery is
//! at-least-once from the subscriber's point of view because a subscriber
//! always re-reads the row after subscribing.
//!
//! Subscriptions unregister themselves on drop, so a waiter that exits on
//! any path (success, failure, timeout, cancel) never leaks a listener.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::types::{PhaseJobId, PipelineId};

// =============================================================================
// Message Types
// =============================================================================

/// Which table a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    PipelineRun,
    PhaseJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A single row change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub row: RowKind,
    pub kind: ChangeKind,
    /// Row id (pipeline id for runs, job id for jobs).
    pub id: String,
    /// Owning pipeline (the run itself for run rows).
    pub pipeline_id: PipelineId,
    /// Status after the write.
    pub status: String,
    /// Row version after the write.
    pub version: u64,
}

/// Subscription predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// One job row.
    Job(PhaseJobId),
    /// One run row.
    Run(PipelineId),
    /// A run row and every job row that references it.
    Pipeline(PipelineId),
}

impl ChangeFilter {
    pub fn matches(&self, change: &RowChange) -> bool {
        match self {
            ChangeFilter::Job(id) => change.row == RowKind::PhaseJob && change.id == id.as_str(),
            ChangeFilter::Run(id) => {
                change.row == RowKind::PipelineRun && change.id == id.as_str()
            }
            ChangeFilter::Pipeline(id) => &change.pipeline_id == id,
        }
    }
}

// =============================================================================
// Subscriber Management
// =============================================================================

#[derive(Debug)]
struct Subscriber {
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<RowChange>,
}

/// Statistics about feed usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FeedStats {
    pub changes_published: u64,
    pub deliveries: u64,
    pub active_subscribers: usize,
}

#[derive(Debug, Default)]
struct FeedInner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    stats: Mutex<FeedStats>,
}

impl FeedInner {
    fn remove(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        subscribers.remove(&id);
        self.stats.lock().active_subscribers = subscribers.len();
    }
}

/// Live subscription handle. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<RowChange>,
    feed: Weak<FeedInner>,
}

impl Subscription {
    /// Next matching change, or `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<RowChange> {
        self.rx.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.remove(self.id);
            tracing::trace!("feed_unsubscribed: id={}", self.id);
        }
    }
}

// =============================================================================
// ChangeFeed
// =============================================================================

/// Cloneable handle to the shared feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change to every subscriber whose filter matches.
    ///
    /// Subscribers whose receiver is gone are pruned.
    pub fn publish(&self, change: RowChange) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.filter.matches(&change) {
                continue;
            }
            if subscriber.tx.send(change.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }
        for id in closed {
            subscribers.remove(&id);
        }

        let mut stats = self.inner.stats.lock();
        stats.changes_published += 1;
        stats.deliveries += delivered as u64;
        stats.active_subscribers = subscribers.len();

        tracing::trace!(
            "feed_published: row={:?}, id={}, status={}, delivered={}",
            change.row,
            change.id,
            change.status,
            delivered
        );
        delivered
    }

    /// Register a filtered subscription.
    pub fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.inner.subscribers.lock();
        subscribers.insert(id, Subscriber { filter, tx });
        self.inner.stats.lock().active_subscribers = subscribers.len();

        Subscription {
            id,
            rx,
            feed: Arc::downgrade(&self.inner),
        }
    }

    pub fn active_subscribers(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn stats(&self) -> FeedStats {
        self.inner.stats.lock().clone()
    }
}
