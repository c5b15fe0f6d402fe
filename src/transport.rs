//!
//! The remote RPC transport contract. This crate consumes a
//! `query`/`mutation`/`subscribe`-shaped remote per collection; only the
//! calls the core makes are specified here — the host owns how they reach
//! the network.
//!
//! The wire format resolves spec.md's open question in favor of binary CRDT
//! updates: [`ChangePayload::Bytes`] is the primary shape used by
//! `pull_changes` and every mutation. [`ChangePayload::Document`] exists
//! only for the server-supplied-materialized-JSON path used during SSR
//! bootstrap (see the `hydrate` argument to [`crate::sync::Orchestrator::start`]).

use crate::checkpoint::Checkpoint;
use serde_json::Value;
use uuid::Uuid;

/// A single changed document as delivered by `pullChanges`.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub id: String,
    pub payload: ChangePayload,
    pub version: u64,
    pub timestamp: u64,
}

/// The two wire shapes a deployment may choose between for a changed
/// document's content.
#[derive(Debug, Clone)]
pub enum ChangePayload {
    Bytes(Vec<u8>),
    Document(Value),
}

/// `pullChanges({ collection, checkpoint, limit })` request.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub collection: String,
    pub checkpoint: Checkpoint,
    pub limit: u32,
}

/// `pullChanges` response.
#[derive(Debug, Clone)]
pub struct PullResult {
    pub changes: Vec<RemoteChange>,
    pub checkpoint: Checkpoint,
    pub has_more: bool,
}

/// The kind of local mutation being pushed, used to select which of
/// `insertDocument | updateDocument | deleteDocument` to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// One of `insertDocument | updateDocument | deleteDocument({ collection,
/// id, bytes?, document?, version })`.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub collection: String,
    pub id: String,
    pub kind: MutationKind,
    pub payload: ChangePayload,
    pub version: u64,
    /// Lets a transport that wants to dedupe distinguish a retried push
    /// from a genuinely new mutation.
    pub idempotency_key: Uuid,
}

/// The result of a successful mutation RPC.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    Success,
    /// An authenticated conflict list. The CRDT itself reconciles the
    /// divergence once the conflicting state is pulled back down, so the
    /// orchestrator treats this the same as success for unreplicated-set
    /// purposes, but logs it.
    Conflict(Vec<Value>),
}

/// `{ bytes, checkpoint, documentCount } | none` from the server snapshot
/// endpoint used by [`crate::recovery`].
#[derive(Debug, Clone)]
pub struct SnapshotPayload {
    pub bytes: Vec<u8>,
    pub checkpoint: Checkpoint,
    pub document_count: u64,
}

/// `changeStream(collection) -> { timestamp, count }`. The host delivers
/// these to [`crate::sync::Orchestrator::on_change_notification`]; the core
/// never subscribes directly, since subscription registration is a
/// transport-specific, host-owned concern.
#[derive(Debug, Clone, Copy)]
pub struct ChangeNotification {
    pub timestamp: u64,
    pub count: u64,
}

/// HTTP-flavored status classification attached to a transport failure, used
/// to distinguish retriable errors from the two non-retriable kinds named in
/// the error handling design (401/403 auth, 422 validation).
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
    /// Set by a transport when [`Self::is_checkpoint_unavailable`] is true,
    /// to the oldest checkpoint the server can still serve a pull from.
    /// Lets the adapter compare its own checkpoint against the server's
    /// retention window via [`crate::recovery::has_diverged`] before
    /// deciding to fall back to snapshot recovery.
    pub retained_since: Option<Checkpoint>,
}

impl RemoteError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retained_since: None,
        }
    }

    /// The sentinel for "initial state unavailable at this checkpoint": the
    /// client's checkpoint predates the server's retained history (HTTP 410
    /// Gone in the REST-flavored transport contract).
    pub fn checkpoint_unavailable(retained_since: Checkpoint) -> Self {
        Self {
            status: Some(410),
            message: "requested checkpoint is no longer retained by the server".to_string(),
            retained_since: Some(retained_since),
        }
    }

    /// 401/403 — non-retriable, surfaced as a fatal auth error.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, Some(401) | Some(403))
    }

    /// 422 — non-retriable, surfaced as a fatal validation error.
    pub fn is_validation_failure(&self) -> bool {
        matches!(self.status, Some(422))
    }

    /// 410 — the client has fallen far enough behind that the server can no
    /// longer serve an incremental pull from its checkpoint.
    pub fn is_checkpoint_unavailable(&self) -> bool {
        matches!(self.status, Some(410))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "transport error ({status}): {}", self.message),
            None => write!(f, "transport error: {}", self.message),
        }
    }
}

/// The remote transport contract the core consumes per collection: pull,
/// push, snapshot-fetch for divergence recovery, and canonical-id fetch for
/// reconciliation.
pub trait RemoteTransport: Send + Sync {
    fn pull_changes(&self, request: PullRequest) -> std::result::Result<PullResult, RemoteError>;

    fn submit_mutation(
        &self,
        request: MutationRequest,
    ) -> std::result::Result<MutationOutcome, RemoteError>;

    /// Fetches a full snapshot for divergence recovery. `Ok(None)` signals
    /// the server has no snapshot available — a data-loss scenario handled
    /// by [`crate::Error::SnapshotMissing`].
    fn fetch_snapshot(
        &self,
        collection: &str,
    ) -> std::result::Result<Option<SnapshotPayload>, RemoteError>;

    /// Fetches the canonical set of ids the server believes exist, used by
    /// [`crate::reconcile`] to find local phantoms.
    fn fetch_canonical_ids(
        &self,
        collection: &str,
    ) -> std::result::Result<Vec<String>, RemoteError>;
}
