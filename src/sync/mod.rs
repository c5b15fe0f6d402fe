//!
//! Sync Adapter (C8): the per-collection pull/push orchestrator. Tied
//! together at startup from the components built so far — durable KV,
//! CRDT document store, checkpoint store, connection monitor, remote
//! transport — it runs as an explicit state machine rather than an async
//! task: a host calls [`Orchestrator::start`] once, then pumps
//! [`Orchestrator::on_tick`] and [`Orchestrator::on_change_notification`]
//! from its own event loop. Nothing here blocks the calling thread; a host
//! offline at startup simply keeps ticking until connectivity returns.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::connection::ConnectionMonitor;
use crate::constants::SyncConfig;
use crate::crdt::DocumentStore;
use crate::kv::DurableKv;
use crate::recovery;
use crate::transport::{
    ChangeNotification, ChangePayload, MutationOutcome, MutationRequest, PullRequest,
    RemoteChange, RemoteError, RemoteTransport,
};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use uuid::Uuid;

/// Bound on the number of change notifications buffered while the initial
/// sync has not yet completed. Once full, the oldest is dropped — a single
/// subsequent incremental pull catches up regardless of how many
/// notifications arrived, so nothing is lost, only coalesced.
const EVENT_BUFFER_CAPACITY: usize = 64;

fn lock<U>(mutex: &Mutex<U>) -> Result<MutexGuard<'_, U>> {
    mutex.lock().map_err(|_| Error::LockPoisoned)
}

/// A point-in-time snapshot of a collection's sync state, for host
/// diagnostics/UI (a "last synced" indicator, a sync spinner).
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub is_initial_sync_complete: bool,
    pub last_checkpoint: Checkpoint,
    pub pending_push_count: usize,
    pub last_error: Option<String>,
}

/// Drives one collection's replication loop.
pub struct Orchestrator<T: DurableKv> {
    collection: String,
    store: Arc<DocumentStore<T>>,
    checkpoints: Arc<CheckpointStore<T>>,
    transport: Arc<dyn RemoteTransport>,
    config: SyncConfig,
    initial_sync_complete: AtomicBool,
    stopped: AtomicBool,
    pull_due: AtomicBool,
    event_buffer: Mutex<VecDeque<ChangeNotification>>,
    last_push_at: Mutex<Option<Instant>>,
    last_pull_at: Mutex<Option<Instant>>,
    last_checkpoint: Mutex<Checkpoint>,
    last_error: Mutex<Option<String>>,
}

impl<T: DurableKv> Orchestrator<T> {
    pub fn new(
        collection: impl Into<String>,
        store: Arc<DocumentStore<T>>,
        checkpoints: Arc<CheckpointStore<T>>,
        transport: Arc<dyn RemoteTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            collection: collection.into(),
            store,
            checkpoints,
            transport,
            config,
            initial_sync_complete: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pull_due: AtomicBool::new(false),
            event_buffer: Mutex::new(VecDeque::new()),
            last_push_at: Mutex::new(None),
            last_pull_at: Mutex::new(None),
            last_checkpoint: Mutex::new(Checkpoint::ZERO),
            last_error: Mutex::new(None),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            is_initial_sync_complete: self.initial_sync_complete.load(Ordering::SeqCst),
            last_checkpoint: *lock(&self.last_checkpoint)?,
            pending_push_count: self.store.get_unreplicated().map(|p| p.len()).unwrap_or(0),
            last_error: lock(&self.last_error)?.clone(),
        })
    }

    /// Startup sequence:
    /// 1. If the host supplies server-hydrated initial records (the SSR
    ///    path), replace local state with them and treat the checkpoint as
    ///    fresh — any stored checkpoint predates this hydration and would
    ///    be stale.
    /// 2. Otherwise, if the connection monitor already reports connected,
    ///    page through `pullChanges` until caught up or
    ///    `initial_replication_barrier` elapses, saving the checkpoint
    ///    after every page so a crash mid-sync resumes rather than
    ///    restarting. If not yet connected, initial sync is deferred
    ///    entirely to the live tick loop — this method never blocks
    ///    waiting for connectivity.
    /// 3. Mark initial sync complete either way — an offline startup still
    ///    unblocks local reads and writes from the persisted cache.
    /// 4. Flush whatever change notifications arrived during startup into
    ///    a pending pull.
    pub fn start(
        &self,
        connection: &ConnectionMonitor,
        hydrate: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<()> {
        if let Some(records) = hydrate {
            self.store.merge_from_materialized(&records)?;
            self.checkpoints.save_checkpoint(&self.collection, Checkpoint::ZERO)?;
            *lock(&self.last_checkpoint)? = Checkpoint::ZERO;
        } else if connection.is_connected() {
            self.initial_pull_all()?;
        } else {
            tracing::warn!(
                collection = %self.collection,
                "starting offline; initial sync deferred to the live pull loop"
            );
        }

        self.initial_sync_complete.store(true, Ordering::SeqCst);

        let mut buffer = lock(&self.event_buffer)?;
        if !buffer.is_empty() {
            buffer.clear();
            self.pull_due.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    /// If `error` signals the server can no longer serve an incremental
    /// pull from `checkpoint` (a sentinel "initial state unavailable at
    /// this checkpoint" response) and the client really has fallen behind
    /// the server's retention window, rebuilds the collection from a
    /// snapshot and returns the checkpoint recovery settled on. Returns
    /// `None` when `error` isn't a divergence signal, so the caller
    /// propagates it as an ordinary transport failure instead.
    fn recover_if_diverged(&self, checkpoint: Checkpoint, error: &RemoteError) -> Result<Option<Checkpoint>> {
        if !error.is_checkpoint_unavailable() {
            return Ok(None);
        }
        let Some(retained_since) = error.retained_since else {
            return Ok(None);
        };
        if !recovery::has_diverged(checkpoint, retained_since) {
            return Ok(None);
        }

        tracing::warn!(
            collection = %self.collection,
            "pull checkpoint predates server retention, recovering from snapshot"
        );
        let recovered = recovery::recover_collection(
            &self.collection,
            &self.store,
            &self.checkpoints,
            self.transport.as_ref(),
        )?;
        Ok(Some(recovered))
    }

    fn initial_pull_all(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.initial_replication_barrier;
        let mut checkpoint = self
            .checkpoints
            .load_checkpoint_with_stale_detection(&self.collection, false)?;

        loop {
            if Instant::now() >= deadline {
                tracing::warn!(
                    collection = %self.collection,
                    "initial replication barrier elapsed, proceeding with partial state"
                );
                break;
            }

            let result = match self.transport.pull_changes(PullRequest {
                collection: self.collection.clone(),
                checkpoint,
                limit: self.config.pull_page_limit,
            }) {
                Ok(result) => result,
                Err(e) => match self.recover_if_diverged(checkpoint, &e)? {
                    Some(recovered) => {
                        checkpoint = recovered;
                        *lock(&self.last_checkpoint)? = checkpoint;
                        continue;
                    }
                    None => return Err(Error::Transport(e.to_string())),
                },
            };

            for change in &result.changes {
                self.apply_remote_change(change)?;
            }

            checkpoint = result.checkpoint;
            self.checkpoints.save_checkpoint(&self.collection, checkpoint)?;
            *lock(&self.last_checkpoint)? = checkpoint;

            if !result.has_more {
                break;
            }
        }

        Ok(())
    }

    /// A single incremental pull pass: pages through `pullChanges` from the
    /// saved checkpoint until the server reports no more pages.
    pub fn pull_incremental(&self) -> Result<()> {
        let mut checkpoint = self.checkpoints.load_checkpoint(&self.collection)?;

        loop {
            let result = match self.transport.pull_changes(PullRequest {
                collection: self.collection.clone(),
                checkpoint,
                limit: self.config.pull_page_limit,
            }) {
                Ok(result) => result,
                Err(e) => match self.recover_if_diverged(checkpoint, &e)? {
                    Some(recovered) => {
                        checkpoint = recovered;
                        *lock(&self.last_checkpoint)? = checkpoint;
                        *lock(&self.last_pull_at)? = Some(Instant::now());
                        continue;
                    }
                    None => return Err(Error::Transport(e.to_string())),
                },
            };

            for change in &result.changes {
                self.apply_remote_change(change)?;
            }

            checkpoint = result.checkpoint;
            self.checkpoints.save_checkpoint(&self.collection, checkpoint)?;
            *lock(&self.last_checkpoint)? = checkpoint;

            *lock(&self.last_pull_at)? = Some(Instant::now());

            if !result.has_more {
                break;
            }
        }

        Ok(())
    }

    /// Applies one pulled change. Both payload shapes are remote-origin, so
    /// neither may enqueue `id` into the local outbox — `store.merge`/
    /// `store.merge_document` are the remote-apply paths that skip it,
    /// unlike `store.create`/`store.change`, which are for user-origin
    /// writes only.
    fn apply_remote_change(&self, change: &RemoteChange) -> Result<()> {
        match &change.payload {
            ChangePayload::Bytes(bytes) => self.store.merge(&change.id, bytes),
            ChangePayload::Document(value) => self.store.merge_document(&change.id, value),
        }
    }

    /// Pushes every outstanding local mutation. Auth failures (401/403)
    /// abort the whole push and are surfaced to the caller; validation
    /// failures (422) are permanent for that mutation and are dropped with
    /// a warning rather than retried forever; any other transport failure
    /// leaves the mutation in the outbox for the next tick.
    pub fn push_pending(&self) -> Result<()> {
        let pending = self.store.get_unreplicated()?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut acknowledged = Vec::new();

        for mutation in pending {
            let request = MutationRequest {
                collection: self.collection.clone(),
                id: mutation.id.clone(),
                kind: mutation.kind,
                payload: ChangePayload::Bytes(mutation.update.clone()),
                version: mutation.version,
                idempotency_key: Uuid::new_v4(),
            };

            match self.transport.submit_mutation(request) {
                Ok(MutationOutcome::Success) => acknowledged.push(mutation.id),
                Ok(MutationOutcome::Conflict(_)) => {
                    tracing::warn!(
                        collection = %self.collection,
                        id = %mutation.id,
                        "push reported a conflict; relying on CRDT merge once the authoritative state is pulled back"
                    );
                    acknowledged.push(mutation.id);
                }
                Err(e) if e.is_auth_failure() => {
                    let cause = e.to_string();
                    *lock(&self.last_error)? = Some(cause.clone());
                    self.store.mark_replicated(&acknowledged)?;
                    return Err(Error::Auth { id: mutation.id, cause });
                }
                Err(e) if e.is_validation_failure() => {
                    tracing::warn!(
                        collection = %self.collection,
                        id = %mutation.id,
                        cause = %e,
                        "push permanently rejected as invalid; dropping from the outbox"
                    );
                    *lock(&self.last_error)? = Some(e.to_string());
                    acknowledged.push(mutation.id);
                }
                Err(e) => {
                    tracing::warn!(
                        collection = %self.collection,
                        id = %mutation.id,
                        cause = %e,
                        "push failed, will retry on the next tick"
                    );
                    *lock(&self.last_error)? = Some(e.to_string());
                    break;
                }
            }
        }

        self.store.mark_replicated(&acknowledged)?;
        *lock(&self.last_push_at)? = Some(Instant::now());
        Ok(())
    }

    /// The host delivers a `changeStream` notification here. Before initial
    /// sync completes, notifications are buffered rather than acted on
    /// immediately, since there is nothing meaningful to pull against yet.
    pub fn on_change_notification(&self, notification: ChangeNotification) -> Result<()> {
        if self.initial_sync_complete.load(Ordering::SeqCst) {
            self.pull_due.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let mut buffer = lock(&self.event_buffer)?;
        if buffer.len() >= EVENT_BUFFER_CAPACITY {
            buffer.pop_front();
            tracing::warn!(
                collection = %self.collection,
                "change notification buffer full during startup, dropping oldest"
            );
        }
        buffer.push_back(notification);
        Ok(())
    }

    /// Pumps the push/pull loop. Only the tab leader should call this with
    /// `is_leader: true`; followers still read/write the local store
    /// directly but do not generate network traffic.
    pub fn on_tick(&self, now: Instant, connection: &ConnectionMonitor, is_leader: bool) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) || !is_leader || !connection.is_connected() {
            return Ok(());
        }

        let push_due = {
            let last = lock(&self.last_push_at)?;
            last.map(|t| now >= t + self.config.push_tick_interval).unwrap_or(true)
        };
        if push_due {
            self.push_pending()?;
        }

        let pull_due = self.pull_due.swap(false, Ordering::SeqCst)
            || {
                let last = lock(&self.last_pull_at)?;
                last.map(|t| now >= t + self.config.push_tick_interval).unwrap_or(true)
            };
        if pull_due {
            self.pull_incremental()?;
        }

        Ok(())
    }

    /// Idempotent: stops further `on_tick` activity. Already-applied state
    /// is untouched.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn store(&self) -> &Arc<DocumentStore<T>> {
        &self.store
    }
}
