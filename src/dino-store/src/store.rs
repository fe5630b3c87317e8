use std::sync::Arc;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};
use tokio::sync::Mutex;

/// A key-value store. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()>;

    /// Returns `DinoError::NotFound` if the key is not in the store.
    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>>;
}

/// A key-value store where every pair carries a version number that must
/// strictly increase on each update.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Returns `DinoError::StalePut` if the given version does not exceed
    /// the stored one. The caller has to prove it has seen the most current
    /// version before updating it.
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> DinoResult<()>;

    /// Returns `DinoError::NotFound` if the key is not in the store.
    async fn get(&self, key: &[u8]) -> DinoResult<(u64, Vec<u8>)>;
}

/// A `VersionedStore` wrapping any plain `Store`. The quickest way of
/// building a versioned store, and also the slowest, as it serializes all
/// calls to the delegate under one lock. Records are stored as an 8-byte
/// big-endian version prefix followed by the value.
pub struct VersionedWrapper {
    delegate: Arc<dyn Store>,
    lock: Mutex<()>,
}

impl VersionedWrapper {
    pub fn new(delegate: Arc<dyn Store>) -> Self {
        Self {
            delegate,
            lock: Mutex::new(()),
        }
    }
}

fn split_versioned(record: &[u8]) -> DinoResult<(u64, &[u8])> {
    if record.len() < 8 {
        return Err(DinoError::StorageError(format!(
            "versioned record too short: {} bytes",
            record.len()
        )));
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&record[..8]);
    Ok((u64::from_be_bytes(prefix), &record[8..]))
}

#[async_trait]
impl VersionedStore for VersionedWrapper {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let _guard = self.lock.lock().await;
        match self.delegate.get(key).await {
            Ok(current) => {
                let (stored, _) = split_versioned(&current)?;
                if version <= stored {
                    return Err(DinoError::StalePut);
                }
            }
            Err(err) if err.is_not_found() => {
                // New keys accept any initial version.
            }
            Err(err) => return Err(err),
        }
        let mut record = Vec::with_capacity(8 + value.len());
        record.extend_from_slice(&version.to_be_bytes());
        record.extend_from_slice(value);
        self.delegate.put(key, &record).await
    }

    async fn get(&self, key: &[u8]) -> DinoResult<(u64, Vec<u8>)> {
        let _guard = self.lock.lock().await;
        let record = self.delegate.get(key).await?;
        let (version, value) = split_versioned(&record)?;
        Ok((version, value.to_vec()))
    }
}
