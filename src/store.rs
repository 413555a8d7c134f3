use std::collections::HashMap;

use parking_lot::Mutex;

pub type Key = i64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("store operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

/// The key-value map under test. Implementations own their internal
/// concurrency safety; every method may be called from many workers at
/// once.
pub trait KvStore: Send + Sync {
    /// Blocks until the backing cluster reports connectivity. Callers
    /// invoke this once before generating load.
    fn await_connected(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, key: Key) -> Result<Option<String>, StoreError>;

    fn set(&self, key: Key, value: String) -> Result<(), StoreError>;

    /// Inserts only when `key` is absent; returns the previously present
    /// value, if any.
    fn put_if_absent(&self, key: Key, value: String) -> Result<Option<String>, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    fn len(&self) -> Result<u64, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// In-memory backend. Stands in for the real cluster map in local test
/// mode and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Key, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: Key) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(&key).cloned())
    }

    fn set(&self, key: Key, value: String) -> Result<(), StoreError> {
        self.entries.lock().insert(key, value);
        Ok(())
    }

    fn put_if_absent(&self, key: Key, value: String) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(key, value);
        Ok(None)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().clear();
        Ok(())
    }

    fn len(&self) -> Result<u64, StoreError> {
        Ok(self.entries.lock().len() as u64)
    }
}

const PAYLOAD_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Deterministic printable-ASCII payload of exactly `size` bytes.
#[must_use]
pub fn value_payload(size: usize, seed: u64) -> String {
    let mut state = seed;
    let mut payload = String::with_capacity(size);
    while payload.len() < size {
        state = splitmix64(state);
        for byte in state.to_le_bytes() {
            if payload.len() == size {
                break;
            }
            let idx = usize::from(byte) % PAYLOAD_ALPHABET.len();
            payload.push(char::from(PAYLOAD_ALPHABET[idx]));
        }
    }
    payload
}

const fn splitmix64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    value ^ (value >> 31)
}
