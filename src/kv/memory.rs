//! An in-memory [`DurableKv`] implementation, with optional JSON
//! file persistence for the same HashMap-of-bytes snapshot idea as the
//! teacher's `InMemoryBackend::save_to_file`/`load_from_file`.

use super::DurableKv;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// A simple in-memory key/value store backed by a `HashMap`.
///
/// Suitable for testing, development, or as the backing store for a host
/// that persists the whole snapshot out-of-band. Never fails on its own;
/// hosts that want to exercise [`super::RetryingKv`]'s retry path should
/// wrap a store that can fail instead.
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Saves the entire store to `path` as a JSON object of base64-free
    /// byte arrays.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("in-memory KV lock was poisoned"))?;
        let json = serde_json::to_string(&*entries)?;
        fs::write(path, json)
    }

    /// Loads a store previously written by [`Self::save_to_file`]. If the
    /// file does not exist, returns a new, empty store.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::new());
        }
        let json = fs::read_to_string(path)?;
        let entries: HashMap<String, Vec<u8>> = serde_json::from_str(&json)?;
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }
}

impl DurableKv for InMemoryKv {
    fn get_raw(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, String> {
        Ok(self.entries.lock().map_err(|e| e.to_string())?.get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &[u8]) -> std::result::Result<(), String> {
        self.entries
            .lock()
            .map_err(|e| e.to_string())?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> std::result::Result<(), String> {
        self.entries.lock().map_err(|e| e.to_string())?.remove(key);
        Ok(())
    }

    fn clear_raw(&self) -> std::result::Result<(), String> {
        self.entries.lock().map_err(|e| e.to_string())?.clear();
        Ok(())
    }
}
