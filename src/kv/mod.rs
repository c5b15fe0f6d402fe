//!
//! Durable KV (C1): wraps a host-supplied key/value store with bounded
//! retries, exponential backoff, and a hard per-call timeout.
//!
//! Every other component treats this layer as potentially failing: a
//! caller that exhausts its retry budget gets back a tagged
//! [`crate::Error::Storage`] and is expected to log it and proceed
//! best-effort, per the storage-failure policy in the error handling
//! design — the in-memory CRDT state, not the KV, is authoritative.

mod memory;

pub use memory::InMemoryKv;

use crate::{Error, Result};
use std::thread;
use std::time::{Duration, Instant};

/// The raw, single-attempt key/value operations a host backing store must
/// provide. Implementations are free to fail transiently (a dropped
/// IndexedDB connection, a full disk); [`RetryingKv`] is what gives callers
/// the retry/backoff/timeout contract.
pub trait DurableKv: Send + Sync {
    /// Fetch the raw bytes stored at `key`, or `None` if absent.
    fn get_raw(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, String>;
    /// Store raw bytes at `key`, overwriting any existing value.
    fn set_raw(&self, key: &str, value: &[u8]) -> std::result::Result<(), String>;
    /// Remove `key`, if present.
    fn delete_raw(&self, key: &str) -> std::result::Result<(), String>;
    /// Remove every key.
    fn clear_raw(&self) -> std::result::Result<(), String>;
}

/// Retry/backoff/timeout policy for one class of KV operation.
#[derive(Debug, Clone, Copy)]
pub struct KvRetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub timeout: Duration,
}

impl KvRetryPolicy {
    /// Policy matching the component design's `get`/`delete` budget: 3
    /// attempts, 100ms initial backoff, 5s timeout.
    pub fn default_read() -> Self {
        Self {
            attempts: crate::constants::KV_READ_RETRIES,
            initial_backoff: crate::constants::KV_READ_BACKOFF,
            timeout: crate::constants::KV_READ_TIMEOUT,
        }
    }

    /// Policy matching the component design's `set` budget: 5 attempts,
    /// 200ms initial backoff, 10s timeout.
    pub fn default_write() -> Self {
        Self {
            attempts: crate::constants::KV_WRITE_RETRIES,
            initial_backoff: crate::constants::KV_WRITE_BACKOFF,
            timeout: crate::constants::KV_WRITE_TIMEOUT,
        }
    }

    /// A policy with the same attempt budget but no sleep between
    /// attempts, for tests that want to exercise retry exhaustion quickly.
    pub fn no_backoff(attempts: u32) -> Self {
        Self {
            attempts,
            initial_backoff: Duration::ZERO,
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Decorates a [`DurableKv`] implementation with the retry/backoff/timeout
/// contract every other component relies on.
pub struct RetryingKv<T: DurableKv> {
    inner: T,
    read_policy: KvRetryPolicy,
    write_policy: KvRetryPolicy,
}

impl<T: DurableKv> RetryingKv<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read_policy: KvRetryPolicy::default_read(),
            write_policy: KvRetryPolicy::default_write(),
        }
    }

    pub fn with_policies(inner: T, read_policy: KvRetryPolicy, write_policy: KvRetryPolicy) -> Self {
        Self {
            inner,
            read_policy,
            write_policy,
        }
    }

    fn run<R>(
        &self,
        operation: &'static str,
        key: &str,
        policy: KvRetryPolicy,
        mut attempt: impl FnMut() -> std::result::Result<R, String>,
    ) -> Result<R> {
        let deadline = Instant::now() + policy.timeout;
        let mut backoff = policy.initial_backoff;
        let mut last_cause = String::new();

        for attempt_index in 0..policy.attempts {
            if Instant::now() >= deadline {
                last_cause = "operation exceeded its timeout".to_string();
                break;
            }
            match attempt() {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    last_cause = cause;
                    if attempt_index + 1 < policy.attempts {
                        tracing::warn!(
                            operation,
                            key,
                            attempt = attempt_index + 1,
                            cause = %last_cause,
                            "durable KV operation failed, retrying"
                        );
                        if !backoff.is_zero() {
                            thread::sleep(backoff);
                        }
                        backoff *= 2;
                    }
                }
            }
        }

        tracing::warn!(operation, key, cause = %last_cause, "durable KV operation exhausted retries");
        Err(Error::Storage {
            operation,
            key: key.to_string(),
            cause: last_cause,
        })
    }

    /// `get(k) -> value | none`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.run("get", key, self.read_policy, || self.inner.get_raw(key))
    }

    /// `set(k, v)`.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.run("set", key, self.write_policy, || {
            self.inner.set_raw(key, value)
        })
    }

    /// `delete(k)`.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.run("delete", key, self.read_policy, || self.inner.delete_raw(key))
    }

    /// `clear()`.
    pub fn clear(&self) -> Result<()> {
        self.run("clear", "*", self.write_policy, || self.inner.clear_raw())
    }

    /// Convenience: fetch and deserialize a JSON-encoded value.
    pub fn get_json<V: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Convenience: serialize and store a value as JSON.
    pub fn set_json<V: serde::Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes)
    }
}
