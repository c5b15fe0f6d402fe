//! Removing local phantoms the server no longer considers canonical.

use crate::helpers::FakeServer;
use replicate_sync::crdt::DocumentStore;
use replicate_sync::kv::{InMemoryKv, RetryingKv};
use replicate_sync::reconcile;
use replicate_sync::transport::{ChangePayload, MutationKind, MutationRequest, RemoteTransport};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct VecSink {
    rows: Mutex<Vec<String>>,
}

impl replicate_sync::binding::ReactiveSink for VecSink {
    type Txn = ();
    type Error = std::convert::Infallible;

    fn begin(&self) -> Result<Self::Txn, Self::Error> {
        Ok(())
    }

    fn write(&self, _txn: &Self::Txn, id: &str, _record: &serde_json::Value) -> Result<(), Self::Error> {
        self.rows.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn delete(&self, _txn: &Self::Txn, id: &str) -> Result<(), Self::Error> {
        self.rows.lock().unwrap().retain(|existing| existing != id);
        Ok(())
    }

    fn commit(&self, _txn: Self::Txn) -> Result<(), Self::Error> {
        Ok(())
    }

    fn truncate(&self) -> Result<(), Self::Error> {
        self.rows.lock().unwrap().clear();
        Ok(())
    }

    fn get(&self, _id: &str) -> Option<serde_json::Value> {
        None
    }

    fn has(&self, id: &str) -> bool {
        self.rows.lock().unwrap().iter().any(|existing| existing == id)
    }

    fn to_array(&self) -> Vec<serde_json::Value> {
        Vec::new()
    }
}

#[test]
fn phantom_created_offline_and_never_accepted_is_removed() {
    let server = FakeServer::new();
    let kv = Arc::new(RetryingKv::new(InMemoryKv::new()));
    let store = DocumentStore::initialize("todos", kv).unwrap();

    // "b" was accepted by the server; "phantom" was created locally while
    // offline and the server has never heard of it.
    store.create("b", &json!({"text": "kept"})).unwrap();
    server
        .submit_mutation(MutationRequest {
            collection: "todos".to_string(),
            id: "b".to_string(),
            kind: MutationKind::Insert,
            payload: ChangePayload::Bytes(store.get_unreplicated().unwrap()[0].update.clone()),
            version: 0,
            idempotency_key: uuid::Uuid::new_v4(),
        })
        .unwrap();
    store.create("phantom", &json!({"text": "never synced"})).unwrap();

    let sink = VecSink::default();
    sink.write(&(), "b", &json!({})).unwrap();
    sink.write(&(), "phantom", &json!({})).unwrap();

    let server_ids = server.fetch_canonical_ids("todos").unwrap();
    let removed = reconcile::reconcile("todos", &store, &sink, &server_ids).unwrap();

    assert_eq!(removed, vec!["phantom".to_string()]);
    assert!(!store.has("phantom"));
    assert!(store.has("b"));
    assert!(!sink.has("phantom"));
    assert!(sink.has("b"));
}

#[test]
fn reconcile_is_a_no_op_when_nothing_has_diverged() {
    let kv = Arc::new(RetryingKv::new(InMemoryKv::new()));
    let store = DocumentStore::initialize("todos", kv).unwrap();
    store.create("a", &json!({"text": "x"})).unwrap();

    let sink = VecSink::default();
    let removed = reconcile::reconcile("todos", &store, &sink, &["a".to_string()]).unwrap();

    assert!(removed.is_empty());
    assert!(store.has("a"));
}
