//!
//! Reconciliation (C7): removes local documents the server no longer
//! considers canonical — ids the client created while offline that the
//! server silently rejected, or ids a hard server-side delete removed
//! without leaving a tombstone the pull stream would ever surface.

use crate::binding::ReactiveSink;
use crate::crdt::DocumentStore;
use crate::kv::DurableKv;
use crate::Result;
use std::collections::HashSet;

/// Computes `keys(local) \ serverIds`: ids the local store believes exist
/// that the server's canonical id set does not contain.
pub fn compute_phantoms(local_ids: &[String], server_ids: &[String]) -> Vec<String> {
    let server: HashSet<&String> = server_ids.iter().collect();
    local_ids
        .iter()
        .filter(|id| !server.contains(id))
        .cloned()
        .collect()
}

/// Removes every phantom id from both the CRDT store and the sink in one
/// pass. A collection with no phantoms is a no-op.
pub fn reconcile<T: DurableKv, S: ReactiveSink>(
    collection: &str,
    store: &DocumentStore<T>,
    sink: &S,
    server_ids: &[String],
) -> Result<Vec<String>> {
    let local_ids = store.known_ids();
    let phantoms = compute_phantoms(&local_ids, server_ids);

    if phantoms.is_empty() {
        return Ok(phantoms);
    }

    tracing::warn!(
        collection,
        count = phantoms.len(),
        "reconciliation removing local phantom documents not present on server"
    );

    let txn = sink
        .begin()
        .map_err(|e| crate::Error::InvalidOperation(e.to_string()))?;
    for id in &phantoms {
        store.purge(id)?;
        sink.delete(&txn, id)
            .map_err(|e| crate::Error::InvalidOperation(e.to_string()))?;
    }
    sink.commit(txn)
        .map_err(|e| crate::Error::InvalidOperation(e.to_string()))?;

    Ok(phantoms)
}
