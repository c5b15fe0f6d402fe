//!
//! CRDT Document Store (C2): one Y-CRDT document per collection. Every
//! document field is its own flat entry in the collection's root map,
//! keyed `"<id>\x01<field>"`, so concurrent edits to different fields of
//! the same document never collide at the CRDT level — each field
//! resolves its own last-writer-wins history independently. A document is
//! never physically removed by a user-facing delete: `remove` sets its
//! `deleted` field to `true` and it stays in the map, retained until an
//! administrative [`DocumentStore::purge`] (reconciliation dropping a
//! server-unknown id).
//!
//! Differential persistence follows the same shape as the teacher's
//! `YrsStore::save_doc`/`get_initial_doc`: the whole document is re-encoded
//! on every mutating call and written to a durable KV key. Unlike the
//! teacher's single backend-wide log, persistence here is keyed per
//! document id (`doc:<coll>/<id>`) so a corrupted or undecodable entry for
//! one id can be skipped on load without losing the rest of the
//! collection — each key holds a full, redundant snapshot of the shared
//! document, so any single surviving key reconstructs the whole thing.

mod listeners;

pub use listeners::Unsubscribe;

use crate::constants::{CLIENT_ID_KEY_PREFIX, DOC_INDEX_KEY_PREFIX};
use crate::delta::{compute_delta, Delta};
use crate::kv::{DurableKv, RetryingKv};
use crate::transport::MutationKind;
use crate::{Error, Result};
use listeners::ListenerSet;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

/// Separates a field key's document id from its field name. Chosen to be a
/// character application ids/field names would never plausibly contain.
const FIELD_SEPARATOR: char = '\u{1}';

fn field_key(id: &str, field: &str) -> String {
    format!("{id}{FIELD_SEPARATOR}{field}")
}

fn split_field_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(FIELD_SEPARATOR)
}

fn doc_key(collection: &str, id: &str) -> String {
    format!("{}{collection}/{id}", crate::constants::DOC_KEY_PREFIX)
}

fn doc_index_key(collection: &str) -> String {
    format!("{DOC_INDEX_KEY_PREFIX}{collection}")
}

fn client_id_key(collection: &str) -> String {
    format!("{CLIENT_ID_KEY_PREFIX}{collection}")
}

/// A single locally-made, not-yet-pushed mutation. Each entry's `update` is
/// a self-contained Y-CRDT diff covering exactly the transaction that made
/// it, so entries can be pushed in any order or independently retried.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: String,
    pub kind: MutationKind,
    pub update: Vec<u8>,
    /// Number of CRDT-visible changes applied to this id so far (local or
    /// merged-remote), monotone non-decreasing per §4.2(b)'s version
    /// accessor contract. Not a vector clock — just enough to let a
    /// transport distinguish a stale push from a fresher one.
    pub version: u64,
}

/// One CRDT-backed collection.
pub struct DocumentStore<T: DurableKv> {
    collection: String,
    kv: Arc<RetryingKv<T>>,
    doc: Doc,
    documents: MapRef,
    pending: Mutex<Vec<PendingMutation>>,
    delta_listeners: ListenerSet<Delta>,
    update_listeners: ListenerSet<Vec<u8>>,
    /// Per-id change counter, bumped on every local mutation or remote
    /// merge touching that id. Backs the "version" accessor required by
    /// §4.2(b).
    versions: Mutex<HashMap<String, u64>>,
    /// Snapshot of the previous materialized view (P in spec.md §3), used
    /// to compute insert/update/delete deltas per §4.2's delta algorithm.
    previous_view: Mutex<HashMap<String, Value>>,
    /// Mirrors the ids currently persisted under `doc:<coll>/<id>`, so a
    /// newly-touched id's durable index can be appended to without a
    /// round-trip read.
    persisted_ids: Mutex<HashSet<String>>,
}

/// Field values are stored as JSON-encoded strings inside each flat map
/// entry, so `yrs` treats each field as an opaque LWW register while this
/// layer still materializes real JSON scalars/objects/arrays.
fn decode_record(value: Value) -> Option<Value> {
    match value {
        Value::String(s) => serde_json::from_str(&s).ok(),
        other => Some(other),
    }
}

impl<T: DurableKv> DocumentStore<T> {
    /// Loads (or creates) the per-collection client id, restores persisted
    /// document state from every known id's KV entry (skipping and
    /// warning on any single id that fails to decode), and initializes the
    /// previous-view snapshot used for delta computation.
    pub fn initialize(collection: impl Into<String>, kv: Arc<RetryingKv<T>>) -> Result<Self> {
        let collection = collection.into();
        let client_id = Self::load_or_assign_client_id(&collection, &kv)?;

        let doc = Doc::with_client_id(client_id);
        let documents = doc.get_or_insert_map("documents");

        let index: Vec<String> = kv.get_json(&doc_index_key(&collection))?.unwrap_or_default();
        for id in &index {
            match kv.get(&doc_key(&collection, id))? {
                Some(bytes) => match Update::decode_v1(&bytes) {
                    Ok(update) => {
                        let mut txn = doc.transact_mut();
                        if let Err(e) = txn.apply_update(update) {
                            tracing::warn!(
                                collection = %collection,
                                id,
                                cause = %e,
                                "failed to apply persisted update for id, skipping"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            collection = %collection,
                            id,
                            cause = %e,
                            "failed to decode persisted update for id, skipping"
                        );
                    }
                },
                None => {}
            }
        }

        let store = Self {
            collection,
            kv,
            doc,
            documents,
            pending: Mutex::new(Vec::new()),
            delta_listeners: ListenerSet::new(),
            update_listeners: ListenerSet::new(),
            versions: Mutex::new(HashMap::new()),
            previous_view: Mutex::new(HashMap::new()),
            persisted_ids: Mutex::new(index.into_iter().collect()),
        };
        let initial_view = store.get_materialized();
        *store.previous_view.lock().map_err(|_| Error::LockPoisoned)? = initial_view;
        Ok(store)
    }

    fn load_or_assign_client_id(collection: &str, kv: &RetryingKv<T>) -> Result<u64> {
        if let Some(existing) = kv.get_json::<u64>(&client_id_key(collection))? {
            return Ok(existing);
        }
        let client_id = (Uuid::new_v4().as_u128() & 0xFFFF_FFFF_FFFF) as u64;
        kv.set_json(&client_id_key(collection), &client_id)?;
        Ok(client_id)
    }

    /// `create(id, data)`: fails with [`Error::AlreadyExists`] if `id` is
    /// already present in the materialized view. `deleted` is normalized
    /// to `false` unless the caller's record already sets it.
    pub fn create(&self, id: &str, record: &Value) -> Result<()> {
        if self.get_materialized_one(id).is_some() {
            return Err(Error::AlreadyExists);
        }
        let mut patch = record.clone();
        if let Value::Object(fields) = &mut patch {
            fields.entry("deleted".to_string()).or_insert(Value::Bool(false));
        }
        self.mutate(id, MutationKind::Insert, &patch)
    }

    /// `change(id, patch)`: require id ∈ current view; writes each field
    /// present in `patch` as its own CRDT entry, leaving untouched fields
    /// (and any concurrent remote edits to them) alone. Fails with
    /// [`Error::NotFound`] if `id` is not present (or is tombstoned).
    pub fn change(&self, id: &str, patch: &Value) -> Result<()> {
        if self.get_materialized_one(id).is_none() {
            return Err(Error::NotFound);
        }
        self.mutate(id, MutationKind::Update, patch)
    }

    /// `remove(id)`: equivalent to `change(id, { deleted: true })` —
    /// tombstones rather than deletes, so the id stays in `keys(Coll)`
    /// until [`Self::purge`]. Fails with [`Error::NotFound`] if `id` is
    /// not currently visible.
    pub fn remove(&self, id: &str) -> Result<()> {
        if self.get_materialized_one(id).is_none() {
            return Err(Error::NotFound);
        }
        self.mutate(id, MutationKind::Delete, &serde_json::json!({"deleted": true}))
    }

    /// Hard-removes every field entry for `id`. Not part of the public
    /// document-mutation contract — only [`crate::reconcile`] calls this,
    /// to drop ids the server has no record of at all, as distinct from a
    /// user-facing [`Self::remove`] tombstone.
    pub(crate) fn purge(&self, id: &str) -> Result<()> {
        {
            let mut txn = self.doc.transact_mut();
            let keys: Vec<String> = self
                .documents
                .keys(&txn)
                .filter(|k| matches!(split_field_key(k), Some((entry_id, _)) if entry_id == id))
                .map(|k| k.to_string())
                .collect();
            for key in keys {
                self.documents.remove(&mut txn, &key);
            }
        }
        self.pending.lock().map_err(|_| Error::LockPoisoned)?.retain(|m| m.id != id);
        self.persisted_ids.lock().map_err(|_| Error::LockPoisoned)?.remove(id);
        self.kv.delete(&doc_key(&self.collection, id))?;
        self.emit_delta()
    }

    fn mutate(&self, id: &str, kind: MutationKind, patch: &Value) -> Result<()> {
        let fields = patch
            .as_object()
            .ok_or_else(|| Error::InvalidOperation("record must be a JSON object".to_string()))?;
        let before_sv = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            for (field, value) in fields {
                let encoded = serde_json::to_string(value)?;
                self.documents.insert(&mut txn, field_key(id, field), encoded);
            }
        }
        self.finish_mutation(id, kind, before_sv)
    }

    fn finish_mutation(&self, id: &str, kind: MutationKind, before_sv: StateVector) -> Result<()> {
        let update = self.doc.transact().encode_state_as_update_v1(&before_sv);
        let version = self.bump_version(id)?;
        self.pending.lock().map_err(|_| Error::LockPoisoned)?.push(PendingMutation {
            id: id.to_string(),
            kind,
            update: update.clone(),
            version,
        });
        self.update_listeners.notify(&update);
        self.persist_for(id)?;
        self.emit_delta()
    }

    fn bump_version(&self, id: &str) -> Result<u64> {
        let mut versions = self.versions.lock().map_err(|_| Error::LockPoisoned)?;
        let counter = versions.entry(id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    /// Monotone non-decreasing count of changes applied to `id` so far.
    /// Degrades to `0` rather than panicking if the internal lock was
    /// poisoned by an earlier panic elsewhere.
    pub fn version_of(&self, id: &str) -> u64 {
        self.versions
            .lock()
            .ok()
            .and_then(|versions| versions.get(id).copied())
            .unwrap_or(0)
    }

    /// Applies a remote Y-CRDT update (from `pullChanges` or a snapshot)
    /// for `id`, idempotently and commutatively by construction —
    /// re-applying an already-known update is a no-op, and order does not
    /// matter. Does not enqueue `id` into the outbox.
    pub fn merge(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let update = Update::decode_v1(bytes).map_err(|e| Error::Decode {
            id: id.to_string(),
            cause: e.to_string(),
        })?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update).map_err(|e| Error::Decode {
                id: id.to_string(),
                cause: e.to_string(),
            })?;
        }
        self.bump_version(id)?;
        self.persist_for(id)?;
        self.update_listeners.notify(&bytes.to_vec());
        self.emit_delta()
    }

    /// `mergeFromMaterialized(id, record)`: applies a server-delivered
    /// materialized JSON document directly, field by field, without
    /// enqueueing `id` into the outbox. Remote-origin writes must never be
    /// mistaken for unacknowledged local mutations — see the
    /// unreplicated-set invariant in §3.
    pub fn merge_document(&self, id: &str, record: &Value) -> Result<()> {
        let fields = record
            .as_object()
            .ok_or_else(|| Error::InvalidOperation("record must be a JSON object".to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            for (field, value) in fields {
                let encoded = serde_json::to_string(value)?;
                self.documents.insert(&mut txn, field_key(id, field), encoded);
            }
            if !fields.contains_key("deleted") {
                self.documents.insert(&mut txn, field_key(id, "deleted"), "false".to_string());
            }
        }
        self.bump_version(id)?;
        self.persist_for(id)?;
        self.emit_delta()
    }

    /// Applies a full-collection snapshot update (e.g. from
    /// [`crate::recovery`]), re-deriving the per-id persisted index from
    /// every id present in the resulting materialized view. Unlike
    /// [`Self::merge`], which is scoped to one id, a snapshot update may
    /// touch arbitrarily many ids at once.
    pub fn apply_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let update = Update::decode_v1(bytes).map_err(|e| Error::Decode {
            id: self.collection.clone(),
            cause: e.to_string(),
        })?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update).map_err(|e| Error::Decode {
                id: self.collection.clone(),
                cause: e.to_string(),
            })?;
        }
        let ids = self.known_ids();
        {
            let mut persisted = self.persisted_ids.lock().map_err(|_| Error::LockPoisoned)?;
            persisted.clear();
            persisted.extend(ids.iter().cloned());
        }
        for id in &ids {
            self.bump_version(id)?;
            self.persist_for(id)?;
        }
        self.update_listeners.notify(&bytes.to_vec());
        self.emit_delta()
    }

    /// Rebuilds this collection's entire document from a materialized JSON
    /// view (the SSR-hydration path, or divergence recovery replaying a
    /// server snapshot already decoded to records). Existing local state is
    /// discarded first.
    pub fn merge_from_materialized(&self, records: &HashMap<String, Value>) -> Result<()> {
        {
            let mut txn = self.doc.transact_mut();
            let existing_keys: Vec<String> = self.documents.keys(&txn).map(|k| k.to_string()).collect();
            for key in existing_keys {
                self.documents.remove(&mut txn, &key);
            }
            for (id, record) in records {
                let Some(fields) = record.as_object() else { continue };
                for (field, value) in fields {
                    let encoded = serde_json::to_string(value)?;
                    self.documents.insert(&mut txn, field_key(id, field), encoded);
                }
                if !fields.contains_key("deleted") {
                    self.documents.insert(&mut txn, field_key(id, "deleted"), "false".to_string());
                }
            }
        }
        {
            let mut persisted = self.persisted_ids.lock().map_err(|_| Error::LockPoisoned)?;
            persisted.clear();
            persisted.extend(records.keys().cloned());
        }
        for id in records.keys() {
            self.bump_version(id)?;
            self.persist_for(id)?;
        }
        self.emit_delta()
    }

    /// The current materialized view: every live (non-tombstoned) id
    /// mapped to its decoded JSON record, each carrying its own `id` and a
    /// normalized boolean `deleted`.
    pub fn get_materialized(&self) -> HashMap<String, Value> {
        let txn = self.doc.transact();
        let mut grouped: HashMap<String, serde_json::Map<String, Value>> = HashMap::new();
        for (key, value) in self.documents.iter(&txn) {
            let Some((id, field)) = split_field_key(key) else { continue };
            let raw = yrs_value_to_json(&txn, value);
            if let Some(decoded) = decode_record(raw) {
                grouped.entry(id.to_string()).or_default().insert(field.to_string(), decoded);
            }
        }
        grouped
            .into_iter()
            .filter_map(|(id, mut fields)| {
                let deleted = fields.get("deleted").and_then(Value::as_bool).unwrap_or(false);
                if deleted {
                    return None;
                }
                fields.entry("deleted".to_string()).or_insert(Value::Bool(false));
                fields.entry("id".to_string()).or_insert_with(|| Value::String(id.clone()));
                Some((id, Value::Object(fields)))
            })
            .collect()
    }

    /// `getMaterialized(id) → record | none`: returns `None` if `id` is
    /// unknown or tombstoned.
    pub fn get_materialized_one(&self, id: &str) -> Option<Value> {
        let txn = self.doc.transact();
        let mut fields = serde_json::Map::new();
        let mut found = false;
        for (key, value) in self.documents.iter(&txn) {
            if let Some((entry_id, field)) = split_field_key(key) {
                if entry_id == id {
                    found = true;
                    let raw = yrs_value_to_json(&txn, value);
                    if let Some(decoded) = decode_record(raw) {
                        fields.insert(field.to_string(), decoded);
                    }
                }
            }
        }
        if !found {
            return None;
        }
        let deleted = fields.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        if deleted {
            return None;
        }
        fields.entry("deleted".to_string()).or_insert(Value::Bool(false));
        fields.entry("id".to_string()).or_insert_with(|| Value::String(id.to_string()));
        Some(Value::Object(fields))
    }

    /// Returns `true` if `id` is currently present in the materialized
    /// view (known and not tombstoned).
    pub fn has(&self, id: &str) -> bool {
        self.get_materialized_one(id).is_some()
    }

    /// Every id the local copy physically retains, tombstoned or not, for
    /// reconciliation's `keys(C2) \ serverIds` phantom computation.
    pub fn known_ids(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut ids: HashSet<String> = HashSet::new();
        for key in self.documents.keys(&txn) {
            if let Some((id, _)) = split_field_key(key) {
                ids.insert(id.to_string());
            }
        }
        ids.into_iter().collect()
    }

    /// Outstanding local mutations not yet acknowledged as pushed.
    pub fn get_unreplicated(&self) -> Result<Vec<PendingMutation>> {
        Ok(self.pending.lock().map_err(|_| Error::LockPoisoned)?.clone())
    }

    /// Clears pushed mutations from the outbox. Only mutations the caller
    /// has confirmed were accepted by the remote should be passed here.
    pub fn mark_replicated(&self, ids: &[String]) -> Result<()> {
        let mut pending = self.pending.lock().map_err(|_| Error::LockPoisoned)?;
        pending.retain(|m| !ids.contains(&m.id));
        Ok(())
    }

    /// Deletes every locally-known id in one transaction, clears the
    /// outbox, and drops all per-id persisted KV entries. Used by
    /// [`crate::recovery`] before replaying a server snapshot.
    pub fn clear(&self) -> Result<()> {
        {
            let mut txn = self.doc.transact_mut();
            let existing_keys: Vec<String> = self.documents.keys(&txn).map(|k| k.to_string()).collect();
            for key in existing_keys {
                self.documents.remove(&mut txn, &key);
            }
        }
        self.pending.lock().map_err(|_| Error::LockPoisoned)?.clear();
        let ids: Vec<String> = self
            .persisted_ids
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .drain()
            .collect();
        for id in &ids {
            self.kv.delete(&doc_key(&self.collection, id))?;
        }
        self.kv.delete(&doc_index_key(&self.collection))?;
        self.emit_delta()
    }

    /// Registers a callback invoked with the insert/update/delete delta
    /// produced by every local mutation, merge, or full-view replace.
    pub fn subscribe_to_delta(&self, listener: impl Fn(&Delta) + Send + Sync + 'static) -> Unsubscribe {
        self.delta_listeners.subscribe(listener)
    }

    /// Registers a callback invoked with the raw Y-CRDT update bytes behind
    /// every local mutation or merge, for hosts that want to pipe updates
    /// to another consumer (e.g. a same-origin tab broadcast).
    pub fn subscribe(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> Unsubscribe {
        self.update_listeners.subscribe(listener)
    }

    /// Diffs the current materialized view against the last-seen snapshot
    /// (P) per §4.2's delta algorithm, replaces P, and notifies delta
    /// listeners if anything changed.
    fn emit_delta(&self) -> Result<()> {
        let mut previous = self.previous_view.lock().map_err(|_| Error::LockPoisoned)?;
        let current = self.get_materialized();
        let delta = compute_delta(&previous, &current);
        *previous = current;
        drop(previous);
        if !delta.is_empty() {
            self.delta_listeners.notify(&delta);
        }
        Ok(())
    }

    fn persist_for(&self, id: &str) -> Result<()> {
        let snapshot = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        self.kv.set(&doc_key(&self.collection, id), &snapshot)?;
        let mut persisted = self.persisted_ids.lock().map_err(|_| Error::LockPoisoned)?;
        if persisted.insert(id.to_string()) {
            let list: Vec<String> = persisted.iter().cloned().collect();
            drop(persisted);
            self.kv.set_json(&doc_index_key(&self.collection), &list)?;
        }
        Ok(())
    }
}

fn yrs_value_to_json<T: ReadTxn>(txn: &T, value: yrs::Value) -> Value {
    match value {
        yrs::Value::Any(any) => any_to_json(any),
        other => Value::String(other.to_string(txn)),
    }
}

fn any_to_json(any: yrs::Any) -> Value {
    match any {
        yrs::Any::Null | yrs::Any::Undefined => Value::Null,
        yrs::Any::Bool(b) => Value::Bool(b),
        yrs::Any::Number(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        yrs::Any::BigInt(i) => Value::Number(i.into()),
        yrs::Any::String(s) => Value::String(s.to_string()),
        yrs::Any::Buffer(bytes) => {
            Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect())
        }
        yrs::Any::Array(items) => Value::Array(items.iter().cloned().map(any_to_json).collect()),
        yrs::Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_json(v.clone())))
                .collect(),
        ),
    }
}
