//! Durable snapshots of run state.
//!
//! Checkpoints are stored as JSON under `{run_id}/{sequence:010}.json`, with
//! sequence numbers increasing per run. Writes are serialized through a
//! single-writer lock; reads never take it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::kv::{KvError, KvStore};
use crate::pipeline::{ErrorRecord, ItemStatus, RetentionPolicy, WorkItem};
use crate::scheduler::QueueState;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] KvError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No checkpoints stored for run '{0}'")]
    NoCheckpoints(String),

    #[error("Checkpoint for run '{run_id}' at sequence {sequence} not found")]
    NotFound { run_id: String, sequence: u64 },
}

/// Aggregate counters carried across checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub ingested: u64,
    pub duplicates_skipped: u64,
    /// Stage attempts completed, successful or not.
    pub stage_steps: u64,
    pub retries: u64,
    pub submissions: u64,
    pub simulated_submissions: u64,
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub config_hash: String,
    /// Every item of the run, including terminal ones.
    pub items: Vec<WorkItem>,
    pub queue: QueueState,
    pub counters: RunCounters,
    pub errors: Vec<ErrorRecord>,
}

impl ExecutionState {
    /// Rewrites `in_progress` items as `pending` at their current stage.
    pub fn normalize(&mut self) {
        for item in &mut self.items {
            item.rehydrate();
        }
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

/// A persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ExecutionState,
}

/// Which checkpoint to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointRef {
    Latest,
    Sequence(u64),
}

/// Summary of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointMeta {
    pub run_id: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub items: usize,
    pub key: String,
}

pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    pub fn key_for(run_id: &str, sequence: u64) -> String {
        format!("{}/{:010}.json", run_id, sequence)
    }

    fn parse_sequence(key: &str) -> Option<u64> {
        key.rsplit('/')
            .next()?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    /// Sequences stored for `run_id`, ascending.
    async fn sequences(&self, run_id: &str) -> Result<Vec<u64>, CheckpointError> {
        let mut sequences: Vec<u64> = self
            .kv
            .list(&format!("{}/", run_id))
            .await?
            .iter()
            .filter_map(|key| Self::parse_sequence(key))
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// Writes a new checkpoint and returns its sequence number.
    pub async fn save(&self, state: &ExecutionState) -> Result<u64, CheckpointError> {
        let _guard = self.write_lock.lock().await;

        let sequence = self
            .sequences(&state.run_id)
            .await?
            .last()
            .map_or(1, |last| last + 1);
        let checkpoint = Checkpoint {
            sequence,
            created_at: Utc::now(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        self.kv
            .put(&Self::key_for(&state.run_id, sequence), &bytes)
            .await?;

        info!(
            run_id = %state.run_id,
            sequence,
            items = state.items.len(),
            "Checkpoint saved"
        );
        Ok(sequence)
    }

    /// Loads a checkpoint with in-progress items normalized to pending.
    pub async fn restore(
        &self,
        run_id: &str,
        which: CheckpointRef,
    ) -> Result<Checkpoint, CheckpointError> {
        let sequence = match which {
            CheckpointRef::Sequence(sequence) => sequence,
            CheckpointRef::Latest => self
                .sequences(run_id)
                .await?
                .last()
                .copied()
                .ok_or_else(|| CheckpointError::NoCheckpoints(run_id.to_string()))?,
        };

        let mut checkpoint = self.load(run_id, sequence).await?;
        checkpoint.state.normalize();
        debug!(run_id, sequence, "Checkpoint restored");
        Ok(checkpoint)
    }

    /// Latest checkpoint, if any, without normalization.
    pub async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.sequences(run_id).await?.last() {
            Some(sequence) => Ok(Some(self.load(run_id, *sequence).await?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, run_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let mut metas = Vec::new();
        for sequence in self.sequences(run_id).await? {
            let checkpoint = self.load(run_id, sequence).await?;
            metas.push(CheckpointMeta {
                run_id: run_id.to_string(),
                sequence,
                created_at: checkpoint.created_at,
                items: checkpoint.state.items.len(),
                key: Self::key_for(run_id, sequence),
            });
        }
        Ok(metas)
    }

    /// Deletes checkpoints outside the retention window. The newest one is
    /// always kept. Returns the number deleted.
    pub async fn prune(
        &self,
        run_id: &str,
        retention: &RetentionPolicy,
    ) -> Result<usize, CheckpointError> {
        let _guard = self.write_lock.lock().await;

        let metas = self.list(run_id).await?;
        let Some(newest) = metas.last().map(|m| m.sequence) else {
            return Ok(0);
        };

        let keep_from = retention
            .max_count
            .map(|max| metas.len().saturating_sub(max.max(1)))
            .unwrap_or(0);
        let now = Utc::now();

        let mut deleted = 0;
        for (index, meta) in metas.iter().enumerate() {
            if meta.sequence == newest {
                continue;
            }
            let over_count = index < keep_from;
            let over_age = retention.max_age_secs.is_some_and(|max_age| {
                (now - meta.created_at).num_seconds() > max_age as i64
            });
            if (over_count || over_age) && self.kv.delete(&meta.key).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(run_id, deleted, "Pruned checkpoints");
        }
        Ok(deleted)
    }

    async fn load(&self, run_id: &str, sequence: u64) -> Result<Checkpoint, CheckpointError> {
        let bytes = self
            .kv
            .get(&Self::key_for(run_id, sequence))
            .await?
            .ok_or_else(|| CheckpointError::NotFound {
                run_id: run_id.to_string(),
                sequence,
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FsKvStore, MemoryKvStore};
    use crate::pipeline::Stage;
    use crate::scheduler::DeferredState;
    use serde_json::json;
    use tempfile::TempDir;

    fn state(run_id: &str) -> ExecutionState {
        let pending = WorkItem::new(json!({"title": "a"}), "fp-a", Stage::Extract);
        let mut running = WorkItem::new(json!({"title": "b"}), "fp-b", Stage::Extract);
        running.begin().unwrap();
        running.advance(Stage::Match).unwrap();
        running.begin().unwrap();
        let mut done = WorkItem::new(json!({"title": "c"}), "fp-c", Stage::Extract);
        done.begin().unwrap();
        done.succeed().unwrap();

        ExecutionState {
            run_id: run_id.to_string(),
            config_hash: "abc".to_string(),
            queue: QueueState {
                ready: vec![pending.id],
                deferred: vec![DeferredState {
                    item_id: running.id,
                    remaining_ms: 1500,
                }],
            },
            items: vec![pending, running, done],
            counters: RunCounters {
                ingested: 3,
                stage_steps: 4,
                ..RunCounters::default()
            },
            errors: vec![],
        }
    }

    fn memory_store() -> CheckpointStore {
        CheckpointStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_restore_of_save_is_normalized_state() {
        let store = memory_store();
        let original = state("run");

        let sequence = store.save(&original).await.unwrap();
        assert_eq!(sequence, 1);

        let restored = store.restore("run", CheckpointRef::Latest).await.unwrap();
        let mut expected = original.clone();
        expected.normalize();
        assert_eq!(restored.state, expected);
        assert_eq!(restored.state.items[1].status, ItemStatus::Pending);
        assert_eq!(restored.state.items[1].stage, Stage::Match);
        assert_eq!(restored.state.count(ItemStatus::InProgress), 0);
    }

    #[tokio::test]
    async fn test_sequences_increase_per_run() {
        let store = memory_store();
        assert_eq!(store.save(&state("a")).await.unwrap(), 1);
        assert_eq!(store.save(&state("a")).await.unwrap(), 2);
        assert_eq!(store.save(&state("b")).await.unwrap(), 1);

        let metas = store.list("a").await.unwrap();
        assert_eq!(
            metas.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(metas[0].key, "a/0000000001.json");

        let first = store.restore("a", CheckpointRef::Sequence(1)).await.unwrap();
        assert_eq!(first.sequence, 1);
    }

    #[tokio::test]
    async fn test_restore_missing() {
        let store = memory_store();
        let err = store.restore("nope", CheckpointRef::Latest).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NoCheckpoints(_)));
        assert!(store.latest("nope").await.unwrap().is_none());

        let err = store
            .restore("nope", CheckpointRef::Sequence(7))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sequence 7"));
    }

    #[tokio::test]
    async fn test_prune_by_count_keeps_newest() {
        let store = memory_store();
        for _ in 0..5 {
            store.save(&state("run")).await.unwrap();
        }

        let deleted = store
            .prune(
                "run",
                &RetentionPolicy {
                    max_count: Some(2),
                    max_age_secs: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        let remaining: Vec<u64> = store
            .list("run")
            .await
            .unwrap()
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_prune_by_age_never_removes_latest() {
        let store = memory_store();
        store.save(&state("run")).await.unwrap();
        store.save(&state("run")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let deleted = store
            .prune(
                "run",
                &RetentionPolicy {
                    max_count: None,
                    max_age_secs: Some(0),
                },
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list("run").await.unwrap().len(), 1);
        assert_eq!(
            store.latest("run").await.unwrap().map(|c| c.sequence),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(Arc::new(FsKvStore::new(dir.path())));
        let original = state("fs-run");

        store.save(&original).await.unwrap();
        assert!(dir.path().join("fs-run/0000000001.json").exists());

        let restored = store.restore("fs-run", CheckpointRef::Latest).await.unwrap();
        assert_eq!(restored.state.items.len(), 3);
        assert_eq!(restored.state.queue, original.queue);
        assert_eq!(restored.state.counters, original.counters);
    }
}
