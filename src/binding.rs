//!
//! Collection Binding (C9): the seam between a reactive, synchronous local
//! mirror (a UI store, an in-memory table a framework re-renders from) and
//! the CRDT document store. User-origin writes go through
//! [`CollectionBinding::insert`]/`update`/`delete`, which apply to the CRDT
//! store first and then to the sink directly, suppressing the echo that
//! would otherwise arrive back through the CRDT store's own delta
//! subscription. Remote-origin deltas (pulls, merges, recovery) are *not*
//! suppressed and flow straight to the sink.

use crate::crdt::{DocumentStore, Unsubscribe};
use crate::kv::DurableKv;
use crate::sync::Orchestrator;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// The local mirror a host renders from. Implementations are typically a
/// thin wrapper over a framework's own reactive store (a Svelte store, a
/// signal, a plain observed `Vec`); `Txn` lets a sink batch a burst of
/// writes (e.g. snapshot recovery's full-collection rebuild) into one
/// reactive update instead of one per document.
pub trait ReactiveSink {
    type Txn;
    type Error: std::fmt::Display;

    fn begin(&self) -> std::result::Result<Self::Txn, Self::Error>;
    fn write(&self, txn: &Self::Txn, id: &str, record: &Value) -> std::result::Result<(), Self::Error>;
    fn delete(&self, txn: &Self::Txn, id: &str) -> std::result::Result<(), Self::Error>;
    fn commit(&self, txn: Self::Txn) -> std::result::Result<(), Self::Error>;
    /// Removes every row the sink currently holds, used before a full
    /// rebuild (snapshot recovery, reconciliation of a large phantom set).
    fn truncate(&self) -> std::result::Result<(), Self::Error>;

    fn get(&self, id: &str) -> Option<Value>;
    fn has(&self, id: &str) -> bool;
    fn to_array(&self) -> Vec<Value>;
}

fn sink_err<E: std::fmt::Display>(e: E) -> crate::Error {
    crate::Error::InvalidOperation(e.to_string())
}

/// Drives an autoCommit push after a local mutation, rate-limited so a burst
/// of edits doesn't fire one network round trip per keystroke.
struct PushTrigger<T: DurableKv> {
    orchestrator: Arc<Orchestrator<T>>,
    coalesce_interval: Duration,
    last_attempt: Option<Instant>,
}

/// Binds one [`DocumentStore`] to one [`ReactiveSink`], keeping them in
/// sync in both directions without an echo loop.
pub struct CollectionBinding<T: DurableKv, S: ReactiveSink> {
    store: Arc<DocumentStore<T>>,
    sink: Arc<S>,
    suppress: Arc<Mutex<HashSet<String>>>,
    _delta_subscription: Unsubscribe,
    push: Mutex<Option<PushTrigger<T>>>,
}

impl<T: DurableKv + 'static, S: ReactiveSink + Send + Sync + 'static> CollectionBinding<T, S> {
    pub fn new(store: Arc<DocumentStore<T>>, sink: Arc<S>) -> Self {
        let suppress = Arc::new(Mutex::new(HashSet::new()));
        let sink_for_listener = sink.clone();
        let suppress_for_listener = suppress.clone();

        let subscription = store.subscribe_to_delta(move |delta| {
            let Ok(mut suppressed) = suppress_for_listener.lock() else {
                return;
            };
            let Ok(txn) = sink_for_listener.begin() else {
                return;
            };
            for (id, record) in delta.inserted.iter().chain(delta.updated.iter()) {
                if suppressed.remove(id) {
                    continue;
                }
                let _ = sink_for_listener.write(&txn, id, record);
            }
            for id in &delta.deleted {
                if suppressed.remove(id) {
                    continue;
                }
                let _ = sink_for_listener.delete(&txn, id);
            }
            let _ = sink_for_listener.commit(txn);
        });

        Self {
            store,
            sink,
            suppress,
            _delta_subscription: subscription,
            push: Mutex::new(None),
        }
    }

    /// Wires an autoCommit push after every local mutation this binding
    /// applies, no more often than `coalesce_interval` — matching
    /// [`crate::constants::SyncConfig::push_coalesce_interval`].
    pub fn with_push(self, orchestrator: Arc<Orchestrator<T>>, coalesce_interval: Duration) -> Self {
        if let Ok(mut guard) = self.push.lock() {
            *guard = Some(PushTrigger {
                orchestrator,
                coalesce_interval,
                last_attempt: None,
            });
        }
        self
    }

    fn lock_suppress(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.suppress.lock().map_err(|_| Error::LockPoisoned)
    }

    /// A user-origin insert: applied to the CRDT store, then mirrored into
    /// the sink directly, suppressing the delta echo.
    pub fn insert(&self, id: &str, record: &Value) -> Result<()> {
        self.lock_suppress()?.insert(id.to_string());
        self.store.create(id, record)?;
        self.write_through(id)?;
        self.maybe_push()?;
        Ok(())
    }

    /// A user-origin update. `record` may be a partial patch — only the
    /// fields present are applied — so the sink is refreshed from the
    /// resulting materialized record rather than the raw patch.
    pub fn update(&self, id: &str, record: &Value) -> Result<()> {
        self.lock_suppress()?.insert(id.to_string());
        self.store.change(id, record)?;
        self.write_through(id)?;
        self.maybe_push()?;
        Ok(())
    }

    /// A user-origin delete (tombstone).
    pub fn delete(&self, id: &str) -> Result<()> {
        self.lock_suppress()?.insert(id.to_string());
        self.store.remove(id)?;
        let txn = self.sink.begin().map_err(sink_err)?;
        self.sink.delete(&txn, id).map_err(sink_err)?;
        self.sink.commit(txn).map_err(sink_err)?;
        self.maybe_push()?;
        Ok(())
    }

    /// Refreshes the sink's row for `id` from the CRDT store's current
    /// materialized view, after a local mutation already applied there.
    fn write_through(&self, id: &str) -> Result<()> {
        let Some(record) = self.store.get_materialized_one(id) else {
            return Ok(());
        };
        let txn = self.sink.begin().map_err(sink_err)?;
        self.sink.write(&txn, id, &record).map_err(sink_err)?;
        self.sink.commit(txn).map_err(sink_err)?;
        Ok(())
    }

    fn maybe_push(&self) -> Result<()> {
        let mut guard = self.push.lock().map_err(|_| Error::LockPoisoned)?;
        let Some(trigger) = guard.as_mut() else {
            return Ok(());
        };
        let now = Instant::now();
        let due = trigger
            .last_attempt
            .map(|last| now >= last + trigger.coalesce_interval)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        trigger.last_attempt = Some(now);
        let orchestrator = trigger.orchestrator.clone();
        drop(guard);
        if let Err(e) = orchestrator.push_pending() {
            tracing::warn!(cause = %e, "autoCommit push after local mutation failed, will retry on next tick");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.sink.get(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.sink.has(id)
    }

    pub fn to_array(&self) -> Vec<Value> {
        self.sink.to_array()
    }

    pub fn store(&self) -> &Arc<DocumentStore<T>> {
        &self.store
    }
}
