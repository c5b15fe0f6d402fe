//!
//! Snapshot Recovery (C6): rebuilds a collection from an authoritative
//! server snapshot when the sync loop detects local state has diverged
//! beyond what incremental pulls can reconcile (a pruned server history, a
//! reset test fixture, a corrupted local persist).

use crate::binding::ReactiveSink;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::crdt::DocumentStore;
use crate::kv::DurableKv;
use crate::transport::RemoteTransport;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Replaces `collection`'s entire local state with the server's
/// authoritative snapshot, then rebuilds `sink` from the result.
///
/// Steps, matching the component design: fetch the snapshot, fail fast if
/// the server has none to offer, delete all locally-known documents and the
/// sink's mirrored rows, apply the snapshot, truncate and rebuild the sink
/// from the resulting materialized view, then save the new checkpoint.
///
/// Use this form when calling from a context that already holds a concrete
/// sink (a host wiring a [`crate::binding::CollectionBinding`] directly, or
/// a test exercising recovery in isolation). [`recover_collection`] covers
/// the same local-state rebuild for a caller, like
/// [`crate::sync::Orchestrator`], that has no sink of its own — any
/// [`crate::binding::CollectionBinding`] already subscribed to the store's
/// deltas picks up the rebuilt state automatically, since both
/// [`DocumentStore::clear`] and [`DocumentStore::apply_snapshot`] emit one.
pub fn recover_from_snapshot<T: DurableKv, S: ReactiveSink>(
    collection: &str,
    store: &DocumentStore<T>,
    checkpoints: &CheckpointStore<T>,
    sink: &S,
    transport: &dyn RemoteTransport,
) -> Result<()> {
    sink.truncate().map_err(|e| Error::InvalidOperation(e.to_string()))?;
    recover_collection(collection, store, checkpoints, transport)?;

    let materialized = store.get_materialized();
    rebuild_sink(sink, &materialized)?;

    Ok(())
}

/// The sink-less core of snapshot recovery: fetches the server's
/// authoritative snapshot, replaces local state with it, and persists the
/// resulting checkpoint. Returns the checkpoint recovery settled on.
pub fn recover_collection<T: DurableKv>(
    collection: &str,
    store: &DocumentStore<T>,
    checkpoints: &CheckpointStore<T>,
    transport: &dyn RemoteTransport,
) -> Result<Checkpoint> {
    let snapshot = transport
        .fetch_snapshot(collection)
        .map_err(|e| Error::Transport(e.to_string()))?
        .ok_or_else(|| Error::SnapshotMissing {
            collection: collection.to_string(),
        })?;

    tracing::warn!(collection, "recovering collection from server snapshot");

    store.clear()?;
    store.apply_snapshot(&snapshot.bytes)?;
    checkpoints.save_checkpoint(collection, snapshot.checkpoint)?;

    tracing::warn!(
        collection,
        documents = snapshot.document_count,
        "snapshot recovery complete"
    );

    Ok(snapshot.checkpoint)
}

fn rebuild_sink<S: ReactiveSink>(sink: &S, records: &HashMap<String, Value>) -> Result<()> {
    let txn = sink.begin().map_err(|e| Error::InvalidOperation(e.to_string()))?;
    for (id, record) in records {
        sink.write(&txn, id, record)
            .map_err(|e| Error::InvalidOperation(e.to_string()))?;
    }
    sink.commit(txn).map_err(|e| Error::InvalidOperation(e.to_string()))?;
    Ok(())
}

/// Detects whether a collection has diverged enough to warrant
/// [`recover_from_snapshot`]/[`recover_collection`]: the checkpoint the
/// client holds predates what the server considers its oldest retained
/// history.
pub fn has_diverged(client_checkpoint: Checkpoint, server_oldest_retained: Checkpoint) -> bool {
    client_checkpoint.last_modified > 0 && client_checkpoint < server_oldest_retained
}
