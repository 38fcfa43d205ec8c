//! Per-item leases.
//!
//! A worker holds a lease on every item it is advancing. The lease table is
//! the only record of which worker owns which item; an item is never leased
//! twice. Leases do not expire: a worker task always settles its item, and a
//! process that dies loses its leases with it, leaving the last checkpoint to
//! restore the item as pending.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::WorkItem;

/// Unique identifier for an item lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Item {item_id} is already leased by {worker_id}")]
    AlreadyLeased { item_id: Uuid, worker_id: String },

    #[error("Lease {0} not found")]
    NotFound(LeaseId),
}

/// Exclusive claim on one item, held until the worker settles it.
#[derive(Debug, Clone)]
pub struct ItemLease {
    pub lease_id: LeaseId,
    pub item_id: Uuid,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Copy of the item as it was claimed; checkpoints record it from here.
    pub item: WorkItem,
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    by_lease: HashMap<LeaseId, ItemLease>,
    by_item: HashMap<Uuid, LeaseId>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases `item` to `worker_id`.
    pub fn acquire(&mut self, item: &WorkItem, worker_id: &str) -> Result<LeaseId, LeaseError> {
        if let Some(existing) = self
            .by_item
            .get(&item.id)
            .and_then(|lease_id| self.by_lease.get(lease_id))
        {
            return Err(LeaseError::AlreadyLeased {
                item_id: item.id,
                worker_id: existing.worker_id.clone(),
            });
        }

        let lease = ItemLease {
            lease_id: LeaseId::new(),
            item_id: item.id,
            worker_id: worker_id.to_string(),
            acquired_at: Utc::now(),
            item: item.clone(),
        };
        let lease_id = lease.lease_id;
        self.by_item.insert(item.id, lease_id);
        self.by_lease.insert(lease_id, lease);
        Ok(lease_id)
    }

    pub fn release(&mut self, lease_id: LeaseId) -> Result<ItemLease, LeaseError> {
        let lease = self
            .by_lease
            .remove(&lease_id)
            .ok_or(LeaseError::NotFound(lease_id))?;
        self.by_item.remove(&lease.item_id);
        Ok(lease)
    }

    pub fn len(&self) -> usize {
        self.by_lease.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_lease.is_empty()
    }

    pub fn leases(&self) -> impl Iterator<Item = &ItemLease> {
        self.by_lease.values()
    }
}
