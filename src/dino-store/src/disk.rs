use std::path::PathBuf;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};
use sha2::{Digest, Sha512};
use tokio::io::AsyncWriteExt;

use crate::Store;

/// A `Store` laying values out under a directory as
/// `<dir>/<first 2 hex>/<full hex>`, files 0600 under directories 0700.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Prevent ENAMETOOLONG, while retaining low probability of clashes.
        let folded;
        let key = if key.len() > Sha512::output_size() {
            folded = Sha512::digest(key);
            folded.as_slice()
        } else {
            key
        };
        let hex = hex::encode(key);
        self.dir.join(&hex[..2.min(hex.len())]).join(&hex)
    }

    async fn write_value(path: &PathBuf, value: &[u8]) -> std::io::Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut f = options.open(path).await?;
        f.write_all(value).await?;
        f.flush().await
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let path = self.path_for(key);
        match Self::write_value(&path, value).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(DinoError::IoError(format!(
                    "could not write {}: {}",
                    path.display(),
                    err
                )));
            }
            Err(_) => {}
        }
        // The fan-out directory does not exist yet.
        if let Some(parent) = path.parent() {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o700);
            builder.create(parent).await.map_err(|err| {
                DinoError::IoError(format!(
                    "could not make dir for {}: {}",
                    path.display(),
                    err
                ))
            })?;
        }
        Self::write_value(&path, value).await.map_err(|err| {
            DinoError::IoError(format!("could not write {}: {}", path.display(), err))
        })
    }

    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DinoError::NotFound(hex::encode(key))
            } else {
                DinoError::IoError(format!("could not read {}: {}", path.display(), err))
            }
        })
    }
}
