use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::{short_key, Store};

const WRITE_BACK_QUEUE: usize = 42;
const WRITE_BACK_RETRY: Duration = Duration::from_secs(1);

/// A `Store` wrapping a pair of stores, one fast, one slow. Puts land in the
/// fast store synchronously and propagate to the slow store from a
/// background queue; gets fall back from fast to slow, refilling the fast
/// store for next time.
///
/// The queue is in memory: killing the process mid-propagation loses the
/// items still queued, and a full queue suspends writers until the slow
/// store catches up.
pub struct Paired {
    fast: Arc<dyn Store>,
    slow: Arc<dyn Store>,
    wbc: mpsc::Sender<(Vec<u8>, Vec<u8>)>,
}

impl Paired {
    /// Must be called within a tokio runtime; spawns the write-back worker,
    /// which exits only when the `Paired` value is dropped.
    pub fn new(fast: Arc<dyn Store>, slow: Arc<dyn Store>) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_BACK_QUEUE);
        tokio::spawn(write_back(slow.clone(), rx));
        Self {
            fast,
            slow,
            wbc: tx,
        }
    }
}

async fn write_back(slow: Arc<dyn Store>, mut rx: mpsc::Receiver<(Vec<u8>, Vec<u8>)>) {
    while let Some((key, value)) = rx.recv().await {
        loop {
            match slow.put(&key, &value).await {
                Ok(()) => {
                    debug!("propagated {} from fast to slow", short_key(&key));
                    break;
                }
                Err(err) => {
                    warn!(
                        "could not propagate {} from fast to slow: {}",
                        short_key(&key),
                        err
                    );
                    tokio::time::sleep(WRITE_BACK_RETRY).await;
                }
            }
        }
    }
}

#[async_trait]
impl Store for Paired {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()> {
        self.fast.put(key, value).await?;
        self.wbc
            .send((key.to_vec(), value.to_vec()))
            .await
            .map_err(|_| DinoError::StorageError("write-back queue closed".to_string()))
    }

    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        match self.fast.get(key).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let value = self.slow.get(key).await?;
        match self.fast.put(key, &value).await {
            Ok(()) => debug!("propagated {} from slow to fast", short_key(key)),
            Err(err) => warn!(
                "could not propagate {} from slow to fast: {}",
                short_key(key),
                err
            ),
        }
        Ok(value)
    }
}
