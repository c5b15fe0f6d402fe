//!
//! replicate-sync: an offline-first CRDT replication engine for reactive
//! client-side collections.
//!
//! This crate keeps a reactive in-memory collection of application
//! documents consistent with a remote authoritative store over an
//! unreliable, possibly-partitioned connection, while permitting concurrent
//! edits across multiple clients and multiple same-origin tabs. Documents
//! are a mapping from string identifier to a JSON-shaped record; mutations
//! are encoded as CRDT operations so concurrent edits converge
//! automatically.
//!
//! ## Core Concepts
//!
//! * **Durable KV (`kv`)**: a retrying, timeout-bounded wrapper around a
//!   host-supplied key/value store.
//! * **CRDT Document Store (`crdt::DocumentStore`)**: one CRDT document per
//!   collection; records local mutations, merges remote updates, and
//!   materializes a JSON view with insert/update/delete deltas.
//! * **Checkpoint Store (`checkpoint`)**: the per-collection pull cursor.
//! * **Connection Monitor (`connection`)**: online/offline/visibility state
//!   machine.
//! * **Tab Leader (`leader`)**: single-leader election across same-origin
//!   tabs.
//! * **Snapshot Recovery (`recovery`)**: divergence recovery from an
//!   authoritative server snapshot.
//! * **Reconciliation (`reconcile`)**: removal of server-deleted phantoms.
//! * **Sync Adapter (`sync::Orchestrator`)**: the per-collection pull/push
//!   loop tying everything together.
//! * **Collection Binding (`binding`)**: translates optimistic reactive-sink
//!   operations into CRDT operations and forwards CRDT deltas back out.
//!
//! This crate is not a plugin host, performs no authentication, and does no
//! schema validation beyond key/id presence.

pub mod binding;
pub mod checkpoint;
pub mod connection;
pub mod constants;
pub mod crdt;
pub mod delta;
pub mod kv;
pub mod leader;
pub mod recovery;
pub mod reconcile;
pub mod registry;
pub mod sync;
pub mod transport;

pub use crdt::DocumentStore;
pub use sync::Orchestrator;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found")]
    NotFound,

    #[error("document already exists")]
    AlreadyExists,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A durable KV operation exhausted its retry budget. Carries enough
    /// context to log at warn and continue best-effort.
    #[error("storage failure: {operation} on {key}: {cause}")]
    Storage {
        operation: &'static str,
        key: String,
        cause: String,
    },

    /// A persisted CRDT update could not be decoded; the owning id is
    /// skipped rather than failing the whole load.
    #[error("failed to decode persisted update for {id}: {cause}")]
    Decode { id: String, cause: String },

    /// Non-retriable authentication failure surfaced from a mutation RPC
    /// (HTTP 401/403 in the remote transport contract).
    #[error("authentication failure pushing {id}: {cause}")]
    Auth { id: String, cause: String },

    /// Non-retriable validation failure surfaced from a mutation RPC
    /// (HTTP 422 in the remote transport contract).
    #[error("validation failure pushing {id}: {cause}")]
    Validation { id: String, cause: String },

    /// The server could not provide a snapshot during divergence recovery.
    /// This is a data-loss scenario and is not recovered from locally.
    #[error("snapshot missing for collection {collection}")]
    SnapshotMissing { collection: String },

    /// A transport call failed in a retriable way (anything other than
    /// 401/403/422). The caller should keep the affected id in the
    /// unreplicated set and retry on the next tick.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("an internal lock was poisoned")]
    LockPoisoned,
}
