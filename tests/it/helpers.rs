//! Shared fixtures for the end-to-end sync test suite: an in-process fake
//! server that plays the role of the remote Y-CRDT-aware backend, so full
//! client/server round trips can be exercised without a network.

use replicate_sync::transport::{
    ChangeNotification, ChangePayload, MutationKind, MutationOutcome, MutationRequest, PullRequest,
    PullResult, RemoteChange, RemoteError, RemoteTransport, SnapshotPayload,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

struct LoggedChange {
    id: String,
    bytes: Vec<u8>,
    timestamp: u64,
}

/// A fake authoritative server: an append-only log of Y-CRDT update bytes,
/// replayable by any client via `pull_changes`, plus a canonical id set
/// maintained alongside it for reconciliation tests.
pub struct FakeServer {
    log: Mutex<Vec<LoggedChange>>,
    canonical: Mutex<HashSet<String>>,
    clock: AtomicU64,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            canonical: Mutex::new(HashSet::new()),
            clock: AtomicU64::new(0),
        }
    }

    fn next_timestamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTransport for FakeServer {
    fn pull_changes(&self, request: PullRequest) -> Result<PullResult, RemoteError> {
        let log = self.log.lock().unwrap();
        let mut changes: Vec<RemoteChange> = log
            .iter()
            .filter(|c| c.timestamp > request.checkpoint.last_modified)
            .take(request.limit as usize)
            .map(|c| RemoteChange {
                id: c.id.clone(),
                payload: ChangePayload::Bytes(c.bytes.clone()),
                version: c.timestamp,
                timestamp: c.timestamp,
            })
            .collect();
        changes.sort_by_key(|c| c.timestamp);

        let checkpoint = changes
            .last()
            .map(|c| replicate_sync::checkpoint::Checkpoint::new(c.timestamp))
            .unwrap_or(request.checkpoint);

        let total_newer = log.iter().filter(|c| c.timestamp > request.checkpoint.last_modified).count();
        let has_more = total_newer > changes.len();

        Ok(PullResult { changes, checkpoint, has_more })
    }

    fn submit_mutation(&self, request: MutationRequest) -> Result<MutationOutcome, RemoteError> {
        let bytes = match request.payload {
            ChangePayload::Bytes(bytes) => bytes,
            ChangePayload::Document(_) => {
                return Err(RemoteError::new(Some(422), "this fake server only accepts binary updates"))
            }
        };

        let timestamp = self.next_timestamp();
        self.log.lock().unwrap().push(LoggedChange {
            id: request.id.clone(),
            bytes,
            timestamp,
        });

        match request.kind {
            MutationKind::Insert | MutationKind::Update => {
                self.canonical.lock().unwrap().insert(request.id);
            }
            MutationKind::Delete => {
                self.canonical.lock().unwrap().remove(&request.id);
            }
        }

        Ok(MutationOutcome::Success)
    }

    fn fetch_snapshot(&self, _collection: &str) -> Result<Option<SnapshotPayload>, RemoteError> {
        let log = self.log.lock().unwrap();
        if log.is_empty() {
            return Ok(None);
        }

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for change in log.iter() {
                let update = Update::decode_v1(&change.bytes)
                    .map_err(|e| RemoteError::new(None, format!("corrupt log entry: {e}")))?;
                txn.apply_update(update)
                    .map_err(|e| RemoteError::new(None, format!("failed to replay log: {e}")))?;
            }
        }
        let txn = doc.transact();
        let bytes = txn.encode_state_as_update_v1(&yrs::StateVector::default());

        Ok(Some(SnapshotPayload {
            bytes,
            checkpoint: replicate_sync::checkpoint::Checkpoint::new(self.clock.load(Ordering::SeqCst)),
            document_count: self.canonical.lock().unwrap().len() as u64,
        }))
    }

    fn fetch_canonical_ids(&self, _collection: &str) -> Result<Vec<String>, RemoteError> {
        Ok(self.canonical.lock().unwrap().iter().cloned().collect())
    }
}

/// A no-op change notification, useful where only the buffering behavior
/// matters and not the payload.
pub fn notification(count: u64) -> ChangeNotification {
    ChangeNotification { timestamp: count, count }
}
