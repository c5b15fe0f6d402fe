//! Tunable timing and sizing constants for the sync engine.
//!
//! This module provides central definitions for the intervals, timeouts, and
//! retry budgets named throughout the component design. Hosts that need
//! different values construct a [`SyncConfig`] rather than editing these
//! defaults in place.

use std::time::Duration;

/// Default reserved collection-settings key, analogous to a schema row.
pub const CLIENT_ID_KEY_PREFIX: &str = "clientId:";
/// Durable KV key prefix for a collection's checkpoint.
pub const CHECKPOINT_KEY_PREFIX: &str = "checkpoint:";
/// Durable KV key prefix for a collection's per-document persisted update.
pub const DOC_KEY_PREFIX: &str = "doc:";
/// Durable KV key prefix for a collection's index of persisted document ids,
/// used to enumerate `doc:<coll>/<id>` keys on [`crate::crdt::DocumentStore`]
/// initialization since the durable KV trait has no scan/list operation.
pub const DOC_INDEX_KEY_PREFIX: &str = "docindex:";
/// Durable KV key for the negotiated protocol version.
pub const PROTOCOL_VERSION_KEY: &str = "protocolVersion";

/// Name of the broadcast channel used for cross-tab leader election.
pub const LEADER_CHANNEL_NAME: &str = "replicate-leader";

/// Time a newly-started tab waits, listening for a heartbeat, before
/// assuming no leader exists and claiming leadership itself.
pub const ELECTION_DELAY: Duration = Duration::from_secs(1);

/// Time since the last observed heartbeat after which a follower assumes
/// the leader has died and starts its own election.
pub const LEADER_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval at which the leader tab broadcasts a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Safety-net interval for the periodic push tick.
pub const PUSH_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between two pushes for the same collection.
pub const PUSH_COALESCE_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum number of changes requested per pull page.
pub const PULL_PAGE_LIMIT: u32 = 100;

/// Ceiling for `waitForConnected()` before it fails.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ceiling for the initial-replication barrier before startup proceeds with
/// empty state and lets live sync catch up.
pub const INITIAL_REPLICATION_BARRIER: Duration = Duration::from_secs(30);

/// Timeout for a protocol-version probe.
pub const PROTOCOL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable KV read timeout.
pub const KV_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Durable KV write timeout.
pub const KV_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Retry attempts for durable KV `get`/`delete`.
pub const KV_READ_RETRIES: u32 = 3;
/// Retry attempts for durable KV `set`.
pub const KV_WRITE_RETRIES: u32 = 5;
/// Initial backoff for durable KV `get`/`delete` retries.
pub const KV_READ_BACKOFF: Duration = Duration::from_millis(100);
/// Initial backoff for durable KV `set` retries.
pub const KV_WRITE_BACKOFF: Duration = Duration::from_millis(200);

/// Tunable configuration for a [`crate::sync::Orchestrator`].
///
/// Constructed by the host application; [`Default`] reproduces the values
/// named in the component design.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub push_tick_interval: Duration,
    pub push_coalesce_interval: Duration,
    pub pull_page_limit: u32,
    pub connect_timeout: Duration,
    pub initial_replication_barrier: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_tick_interval: PUSH_TICK_INTERVAL,
            push_coalesce_interval: PUSH_COALESCE_INTERVAL,
            pull_page_limit: PULL_PAGE_LIMIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            initial_replication_barrier: INITIAL_REPLICATION_BARRIER,
        }
    }
}

/// Tunable configuration for a [`crate::leader::TabLeader`].
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub election_delay: Duration,
    pub leader_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            election_delay: ELECTION_DELAY,
            leader_timeout: LEADER_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}
