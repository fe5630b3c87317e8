use std::sync::Arc;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::{Store, VersionedStore};

fn map_object_err(key: &[u8], err: object_store::Error) -> DinoError {
    match err {
        object_store::Error::NotFound { .. } => DinoError::NotFound(hex::encode(key)),
        other => DinoError::RemoteError(other.to_string()),
    }
}

fn build_s3(
    bucket: &str,
    region: &str,
    endpoint: &str,
    access_key: &str,
    secret_key: &str,
) -> DinoResult<Arc<dyn ObjectStore>> {
    let store = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(region)
        .with_endpoint(endpoint)
        .with_access_key_id(access_key)
        .with_secret_access_key(secret_key)
        .build()
        .map_err(|e| DinoError::InvalidParam(format!("bucket {}: {}", bucket, e)))?;
    Ok(Arc::new(store))
}

/// A `Store` keeping hex-keyed objects in an S3-compatible bucket.
pub struct BucketStore {
    store: Arc<dyn ObjectStore>,
}

impl BucketStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn open(
        bucket: &str,
        region: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> DinoResult<Self> {
        Ok(Self::new(build_s3(
            bucket, region, endpoint, access_key, secret_key,
        )?))
    }
}

fn path_for(key: &[u8]) -> ObjectPath {
    ObjectPath::from(hex::encode(key))
}

#[async_trait]
impl Store for BucketStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()> {
        self.store
            .put(&path_for(key), PutPayload::from(value.to_vec()))
            .await
            .map_err(|e| map_object_err(key, e))?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        let result = self
            .store
            .get(&path_for(key))
            .await
            .map_err(|e| map_object_err(key, e))?;
        let data = result
            .bytes()
            .await
            .map_err(|e| map_object_err(key, e))?;
        Ok(data.to_vec())
    }
}

/// A `VersionedStore` over an S3-compatible bucket. Each object holds the
/// 8-byte big-endian version followed by the value; updates are conditional
/// writes keyed on the object version read beforehand, so a lost race
/// surfaces as a stale put just like a version that is not new enough.
pub struct BucketVersionedStore {
    store: Arc<dyn ObjectStore>,
}

impl BucketVersionedStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn open(
        bucket: &str,
        region: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> DinoResult<Self> {
        Ok(Self::new(build_s3(
            bucket, region, endpoint, access_key, secret_key,
        )?))
    }
}

fn versioned_payload(version: u64, value: &[u8]) -> PutPayload {
    let mut record = Vec::with_capacity(8 + value.len());
    record.extend_from_slice(&version.to_be_bytes());
    record.extend_from_slice(value);
    PutPayload::from(record)
}

fn split_record(key: &[u8], record: &[u8]) -> DinoResult<(u64, Vec<u8>)> {
    if record.len() < 8 {
        return Err(DinoError::StorageError(format!(
            "versioned object {} too short: {} bytes",
            crate::short_key(key),
            record.len()
        )));
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&record[..8]);
    Ok((u64::from_be_bytes(prefix), record[8..].to_vec()))
}

#[async_trait]
impl VersionedStore for BucketVersionedStore {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let path = path_for(key);
        let update = match self.store.get(&path).await {
            Ok(result) => {
                let meta = result.meta.clone();
                let record = result.bytes().await.map_err(|e| map_object_err(key, e))?;
                let (stored, _) = split_record(key, &record)?;
                if version <= stored {
                    return Err(DinoError::StalePut);
                }
                Some(UpdateVersion {
                    e_tag: meta.e_tag,
                    version: meta.version,
                })
            }
            Err(object_store::Error::NotFound { .. }) => None,
            Err(err) => return Err(map_object_err(key, err)),
        };
        let mode = match update {
            Some(update) => PutMode::Update(update),
            None => PutMode::Create,
        };
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&path, versioned_payload(version, value), opts)
            .await
        {
            Ok(_) => Ok(()),
            // Another writer got in between our read and our conditional
            // write; the caller must refresh and decide again.
            Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::AlreadyExists { .. }) => Err(DinoError::StalePut),
            Err(err) => Err(map_object_err(key, err)),
        }
    }

    async fn get(&self, key: &[u8]) -> DinoResult<(u64, Vec<u8>)> {
        let result = self
            .store
            .get(&path_for(key))
            .await
            .map_err(|e| map_object_err(key, e))?;
        let record = result.bytes().await.map_err(|e| map_object_err(key, e))?;
        split_record(key, &record)
    }
}
