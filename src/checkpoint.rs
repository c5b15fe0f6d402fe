//!
//! Checkpoint Store (C3): persists the per-collection pull cursor and
//! detects a stale cursor on startup when an initial payload has already
//! repositioned the watermark (the SSR path).

use crate::constants::CHECKPOINT_KEY_PREFIX;
use crate::kv::{DurableKv, RetryingKv};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A server-time watermark up to which the client has observed and merged
/// remote changes for a collection.
///
/// Invariant: after a successful pull returning <= N changes, the
/// checkpoint equals the largest server timestamp among returned changes,
/// or the previous checkpoint if none were returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_modified: u64,
}

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint { last_modified: 0 };

    pub fn new(last_modified: u64) -> Self {
        Self { last_modified }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::ZERO
    }
}

fn checkpoint_key(collection: &str) -> String {
    format!("{CHECKPOINT_KEY_PREFIX}{collection}")
}

/// Durable storage for per-collection checkpoints, backed by the durable
/// KV layer.
pub struct CheckpointStore<T: DurableKv> {
    kv: Arc<RetryingKv<T>>,
}

impl<T: DurableKv> CheckpointStore<T> {
    pub fn new(kv: Arc<RetryingKv<T>>) -> Self {
        Self { kv }
    }

    /// `loadCheckpoint(coll)`.
    pub fn load_checkpoint(&self, collection: &str) -> Result<Checkpoint> {
        Ok(self
            .kv
            .get_json(&checkpoint_key(collection))?
            .unwrap_or_default())
    }

    /// `saveCheckpoint(coll, K)`. Called only after a successful pull
    /// commits its resulting changes to the CRDT document store.
    pub fn save_checkpoint(&self, collection: &str, checkpoint: Checkpoint) -> Result<()> {
        self.kv.set_json(&checkpoint_key(collection), &checkpoint)
    }

    /// `clearCheckpoint(coll)`.
    pub fn clear_checkpoint(&self, collection: &str) -> Result<()> {
        self.kv.delete(&checkpoint_key(collection))
    }

    /// `loadCheckpointWithStaleDetection(coll, hasInitialData)`.
    ///
    /// If `has_initial_data` is true, the initial payload has already
    /// repositioned the watermark for this collection, so the stored
    /// checkpoint (if any) is stale and is ignored in favor of zero.
    pub fn load_checkpoint_with_stale_detection(
        &self,
        collection: &str,
        has_initial_data: bool,
    ) -> Result<Checkpoint> {
        if has_initial_data {
            return Ok(Checkpoint::ZERO);
        }
        self.load_checkpoint(collection)
    }
}
