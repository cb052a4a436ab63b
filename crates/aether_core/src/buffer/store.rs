//! Durable backing for the transmission queue.

use std::collections::VecDeque;
use std::path::Path;

use parking_lot::Mutex;

use super::BufferedSample;
use crate::error::StorageError;

/// A single keyed record holding the whole serialized queue.
///
/// Implementations must tolerate a load at startup racing with writes from
/// the owning buffer; the buffer itself serializes its own read-modify-write.
pub trait QueueStore: Send + Sync {
    /// Read the stored queue. A missing record is an empty queue.
    fn load(&self) -> Result<VecDeque<BufferedSample>, StorageError>;

    /// Replace the stored queue.
    fn save(&self, queue: &VecDeque<BufferedSample>) -> Result<(), StorageError>;
}

/// sled-backed store, the queue is JSON under a fixed key.
#[derive(Debug, Clone)]
pub struct SledQueueStore {
    db: sled::Db,
    key: String,
}

impl SledQueueStore {
    pub fn open(path: impl AsRef<Path>, key: impl Into<String>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|cause| StorageError::Open {
            path: path.display().to_string(),
            cause,
        })?;
        Ok(Self {
            db,
            key: key.into(),
        })
    }

    /// Store in a temporary sled database that is removed on drop.
    pub fn temporary(key: impl Into<String>) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|cause| StorageError::Open {
                path: "<temporary>".to_string(),
                cause,
            })?;
        Ok(Self {
            db,
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl QueueStore for SledQueueStore {
    fn load(&self) -> Result<VecDeque<BufferedSample>, StorageError> {
        let raw = self
            .db
            .get(self.key.as_bytes())
            .map_err(|cause| StorageError::Io {
                operation: "read",
                key: self.key.clone(),
                cause,
            })?;

        match raw {
            Some(bytes) => decode(&self.key, &bytes),
            None => Ok(VecDeque::new()),
        }
    }

    fn save(&self, queue: &VecDeque<BufferedSample>) -> Result<(), StorageError> {
        let bytes = encode(&self.key, queue)?;
        self.db
            .insert(self.key.as_bytes(), bytes)
            .map_err(|cause| StorageError::Io {
                operation: "write",
                key: self.key.clone(),
                cause,
            })?;
        self.db.flush().map_err(|cause| StorageError::Io {
            operation: "flush",
            key: self.key.clone(),
            cause,
        })?;
        Ok(())
    }
}

/// In-memory store holding the encoded record, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    record: Mutex<Option<Vec<u8>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing raw record.
    pub fn with_record(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            record: Mutex::new(Some(bytes.into())),
        }
    }

    /// Raw bytes currently stored, if any.
    pub fn record(&self) -> Option<Vec<u8>> {
        self.record.lock().clone()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<VecDeque<BufferedSample>, StorageError> {
        match self.record.lock().as_deref() {
            Some(bytes) => decode("memory", bytes),
            None => Ok(VecDeque::new()),
        }
    }

    fn save(&self, queue: &VecDeque<BufferedSample>) -> Result<(), StorageError> {
        let bytes = encode("memory", queue)?;
        *self.record.lock() = Some(bytes);
        Ok(())
    }
}

fn decode(key: &str, bytes: &[u8]) -> Result<VecDeque<BufferedSample>, StorageError> {
    serde_json::from_slice(bytes).map_err(|cause| StorageError::Corrupt {
        key: key.to_string(),
        cause,
    })
}

fn encode(key: &str, queue: &VecDeque<BufferedSample>) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(queue).map_err(|cause| StorageError::Corrupt {
        key: key.to_string(),
        cause,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationSample;
    use tempfile::TempDir;

    fn sample(lat: f64) -> BufferedSample {
        BufferedSample::offline(LocationSample::new(lat, 0.5, Some(1.0), 5.0))
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let queue: VecDeque<_> = vec![sample(1.0), sample(2.0)].into();

        {
            let store = SledQueueStore::open(dir.path(), "queue").unwrap();
            store.save(&queue).unwrap();
        }

        let store = SledQueueStore::open(dir.path(), "queue").unwrap();
        let loaded = store.load().unwrap();
        let lats: Vec<_> = loaded.iter().map(|b| b.sample.latitude).collect();
        assert_eq!(lats, vec![1.0, 2.0]);
        assert!(loaded.iter().all(|b| b.offline));
    }

    #[test]
    fn test_sled_store_missing_key_is_empty() {
        let store = SledQueueStore::temporary("nothing-here").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_corrupt_record() {
        let store = MemoryQueueStore::with_record(b"{not json".to_vec());
        assert!(matches!(store.load(), Err(StorageError::Corrupt { .. })));
    }
}
