//! In-process priority queue of work items.
//!
//! Ready items are ordered by:
//!
//! 1. Tier, when decided: `submit` before `review` before undecided
//! 2. The `high_priority` flag within a tier
//! 3. Composite score, descending (undecided items rank lowest)
//! 4. Creation time, oldest first
//! 5. Insertion sequence
//!
//! Pre-decision stages therefore run roughly FIFO while post-decision stages
//! favour high-value items. Items waiting out a retry delay sit in a separate
//! deferred heap until their `ready_at` instant passes.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::pipeline::WorkItem;

/// Ordering key derived from an item when it is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PriorityKey {
    tier_rank: u8,
    high_priority: bool,
    composite: OrderedFloat<f64>,
    created_at: DateTime<Utc>,
    sequence: u64,
}

impl PriorityKey {
    fn for_item(item: &WorkItem, sequence: u64) -> Self {
        let (tier_rank, high_priority, composite) = match &item.decision {
            Some(decision) => (
                decision.tier.rank(),
                decision.high_priority,
                decision.composite,
            ),
            None => (0, false, f64::NEG_INFINITY),
        };
        Self {
            tier_rank,
            high_priority,
            composite: OrderedFloat(composite),
            created_at: item.created_at,
            sequence,
        }
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier_rank
            .cmp(&other.tier_rank)
            .then(self.high_priority.cmp(&other.high_priority))
            .then(self.composite.cmp(&other.composite))
            .then(other.created_at.cmp(&self.created_at))
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct ReadyEntry {
    key: PriorityKey,
    item: WorkItem,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ReadyEntry {}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct DeferredEntry {
    ready_at: Instant,
    sequence: u64,
    item: WorkItem,
}

impl PartialEq for DeferredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.sequence == other.sequence
    }
}

impl Eq for DeferredEntry {}

impl Ord for DeferredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for DeferredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Serializable queue contents, referencing items by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Ready items in dispatch order.
    pub ready: Vec<Uuid>,
    pub deferred: Vec<DeferredState>,
}

/// A deferred entry and the delay it still had to wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredState {
    pub item_id: Uuid,
    pub remaining_ms: u64,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    ready: BinaryHeap<ReadyEntry>,
    deferred: BinaryHeap<Reverse<DeferredEntry>>,
    sequence: u64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an item for immediate dispatch.
    pub fn push(&mut self, item: WorkItem) {
        let key = PriorityKey::for_item(&item, self.next_sequence());
        self.ready.push(ReadyEntry { key, item });
    }

    /// Enqueues an item that becomes ready after `delay`.
    pub fn push_deferred(&mut self, item: WorkItem, delay: Duration, now: Instant) {
        let sequence = self.next_sequence();
        self.deferred.push(Reverse(DeferredEntry {
            ready_at: now + delay,
            sequence,
            item,
        }));
    }

    /// Moves every deferred entry whose delay has elapsed into the ready heap.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self
            .deferred
            .peek()
            .is_some_and(|Reverse(entry)| entry.ready_at <= now)
        {
            if let Some(Reverse(entry)) = self.deferred.pop() {
                self.push(entry.item);
                promoted += 1;
            }
        }
        promoted
    }

    /// Highest-priority ready item.
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.ready.pop().map(|entry| entry.item)
    }

    /// When the earliest deferred entry becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.deferred.peek().map(|Reverse(entry)| entry.ready_at)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every queued item, ready first in dispatch order, then deferred.
    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        let mut ready: Vec<&ReadyEntry> = self.ready.iter().collect();
        ready.sort_by(|a, b| b.cmp(a));
        ready
            .into_iter()
            .map(|entry| &entry.item)
            .chain(self.deferred.iter().map(|Reverse(entry)| &entry.item))
    }

    /// Queue contents by id, with remaining deferral relative to `now`.
    pub fn state(&self, now: Instant) -> QueueState {
        let mut ready: Vec<&ReadyEntry> = self.ready.iter().collect();
        ready.sort_by(|a, b| b.cmp(a));

        let mut deferred: Vec<&DeferredEntry> =
            self.deferred.iter().map(|Reverse(entry)| entry).collect();
        deferred.sort();

        QueueState {
            ready: ready.into_iter().map(|entry| entry.item.id).collect(),
            deferred: deferred
                .into_iter()
                .map(|entry| DeferredState {
                    item_id: entry.item.id,
                    remaining_ms: entry.ready_at.saturating_duration_since(now).as_millis() as u64,
                })
                .collect(),
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}
