//! Snapshot recovery from a diverged local state.

use crate::helpers::FakeServer;
use replicate_sync::binding::ReactiveSink;
use replicate_sync::checkpoint::CheckpointStore;
use replicate_sync::crdt::DocumentStore;
use replicate_sync::kv::{InMemoryKv, RetryingKv};
use replicate_sync::recovery;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct VecSink {
    rows: Mutex<HashMap<String, Value>>,
}

impl ReactiveSink for VecSink {
    type Txn = ();
    type Error = std::convert::Infallible;

    fn begin(&self) -> Result<Self::Txn, Self::Error> {
        Ok(())
    }

    fn write(&self, _txn: &Self::Txn, id: &str, record: &Value) -> Result<(), Self::Error> {
        self.rows.lock().unwrap().insert(id.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, _txn: &Self::Txn, id: &str) -> Result<(), Self::Error> {
        self.rows.lock().unwrap().remove(id);
        Ok(())
    }

    fn commit(&self, _txn: Self::Txn) -> Result<(), Self::Error> {
        Ok(())
    }

    fn truncate(&self) -> Result<(), Self::Error> {
        self.rows.lock().unwrap().clear();
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Value> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    fn has(&self, id: &str) -> bool {
        self.rows.lock().unwrap().contains_key(id)
    }

    fn to_array(&self) -> Vec<Value> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}

#[test]
fn recover_from_snapshot_replaces_diverged_local_state() {
    let server = FakeServer::new();

    // Two peers establish server state the recovering client never saw
    // directly — it only has stale local data of its own.
    let seeder_kv = Arc::new(RetryingKv::new(InMemoryKv::new()));
    let seeder = DocumentStore::initialize("todos", seeder_kv).unwrap();
    seeder.create("a", &json!({"text": "from the server"})).unwrap();
    let seed_update = seeder.get_unreplicated().unwrap()[0].update.clone();
    server
        .submit_mutation(replicate_sync::transport::MutationRequest {
            collection: "todos".to_string(),
            id: "a".to_string(),
            kind: replicate_sync::transport::MutationKind::Insert,
            payload: replicate_sync::transport::ChangePayload::Bytes(seed_update),
            version: 0,
            idempotency_key: uuid::Uuid::new_v4(),
        })
        .unwrap();

    let client_kv = Arc::new(RetryingKv::new(InMemoryKv::new()));
    let client_store = DocumentStore::initialize("todos", client_kv.clone()).unwrap();
    client_store.create("stale", &json!({"text": "will be discarded"})).unwrap();

    let checkpoints = CheckpointStore::new(client_kv);
    let sink = VecSink::default();

    recovery::recover_from_snapshot("todos", &client_store, &checkpoints, &sink, &server).unwrap();

    assert!(!client_store.has("stale"));
    assert_eq!(
        sink.get("a"),
        Some(json!({"id": "a", "text": "from the server", "deleted": false}))
    );
    assert_eq!(
        client_store.get_materialized().get("a"),
        Some(&json!({"id": "a", "text": "from the server", "deleted": false}))
    );
}

#[test]
fn recovery_fails_fast_when_server_has_no_snapshot() {
    let server = FakeServer::new();
    let client_kv = Arc::new(RetryingKv::new(InMemoryKv::new()));
    let client_store = DocumentStore::initialize("todos", client_kv.clone()).unwrap();
    let checkpoints = CheckpointStore::new(client_kv);
    let sink = VecSink::default();

    let result = recovery::recover_from_snapshot("todos", &client_store, &checkpoints, &sink, &server);
    assert!(matches!(result, Err(replicate_sync::Error::SnapshotMissing { .. })));
}
