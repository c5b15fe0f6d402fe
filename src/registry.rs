//!
//! Collection registry: deduplicates [`crate::sync::Orchestrator`]
//! construction per collection name, so a host that re-runs setup code on
//! hot module reload (or re-mounts a component) gets back the same running
//! orchestrator instead of a second one racing the first for the same
//! durable KV keys.

use crate::checkpoint::CheckpointStore;
use crate::constants::SyncConfig;
use crate::crdt::DocumentStore;
use crate::kv::{DurableKv, RetryingKv};
use crate::sync::Orchestrator;
use crate::transport::RemoteTransport;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Builds and caches one [`Orchestrator`] per collection name.
pub struct CollectionRegistry<T: DurableKv> {
    kv: Arc<RetryingKv<T>>,
    transport: Arc<dyn RemoteTransport>,
    config: SyncConfig,
    orchestrators: Mutex<HashMap<String, Arc<Orchestrator<T>>>>,
}

impl<T: DurableKv> CollectionRegistry<T> {
    pub fn new(kv: Arc<RetryingKv<T>>, transport: Arc<dyn RemoteTransport>, config: SyncConfig) -> Self {
        Self {
            kv,
            transport,
            config,
            orchestrators: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing orchestrator for `collection` if one has
    /// already been constructed, otherwise builds and caches a new one.
    /// The constructed orchestrator has not had [`Orchestrator::start`]
    /// called on it — that remains the caller's responsibility, since only
    /// the caller knows whether this is a first mount (wants a real
    /// startup sequence) or a hot-reload remount (wants to skip it).
    pub fn get_or_create(&self, collection: &str) -> Result<Arc<Orchestrator<T>>> {
        let mut orchestrators = self.orchestrators.lock().map_err(|_| crate::Error::LockPoisoned)?;
        if let Some(existing) = orchestrators.get(collection) {
            return Ok(existing.clone());
        }

        let store = Arc::new(DocumentStore::initialize(collection, self.kv.clone())?);
        // Checkpoints live under their own key prefix in the same backing
        // store, so they share the durable KV instance with the document
        // store rather than owning a separate one.
        let checkpoints = Arc::new(CheckpointStore::new(self.kv.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            collection,
            store,
            checkpoints,
            self.transport.clone(),
            self.config.clone(),
        ));

        orchestrators.insert(collection.to_string(), orchestrator.clone());
        Ok(orchestrator)
    }

    /// The collections currently registered, for diagnostics.
    pub fn collections(&self) -> Vec<String> {
        self.orchestrators
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }
}
