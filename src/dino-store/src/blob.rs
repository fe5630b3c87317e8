use std::sync::Arc;

use dino_lib::DinoResult;
use sha1::{Digest, Sha1};

use crate::Store;

/// Wraps a `Store` so that content is never overwritten, by keying every
/// value under the SHA-1 hash of its bytes. Concurrent writes for the same
/// key are safe because they carry equal contents (with very high
/// probability), and identical values de-duplicate to one blob.
pub struct BlobStore {
    delegate: Arc<dyn Store>,
}

impl BlobStore {
    pub fn new(delegate: Arc<dyn Store>) -> Self {
        Self { delegate }
    }

    pub async fn put(&self, value: &[u8]) -> DinoResult<Vec<u8>> {
        let key = Sha1::digest(value).to_vec();
        self.delegate.put(&key, value).await?;
        Ok(key)
    }

    pub async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        self.delegate.get(key).await
    }
}
