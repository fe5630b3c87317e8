use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult, Message, MonotoneTags, BROADCAST_TAG};
use dino_store::{apply_message, InMemoryStore, VersionedStore, VersionedWrapper};
use log::{debug, error};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::Client;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Called for every broadcast put applied to the local cache, so the node
/// layer can invalidate what it has in memory.
pub type ChangeListener =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Rendezvous {
    waiting: HashMap<u16, oneshot::Sender<Message>>,
    stopped: bool,
}

/// A `VersionedStore` backed by a remote metadata broker. Requests are
/// correlated with responses through tags; broadcasts from the broker are
/// folded into a local in-memory cache, which serves gets without a round
/// trip once populated.
pub struct RemoteVersionedStore {
    tags: MonotoneTags,
    remote: Arc<Client>,
    local: VersionedWrapper,
    listener: Option<ChangeListener>,
    request_timeout: Duration,
    state: std::sync::Mutex<Rendezvous>,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RemoteVersionedStore {
    pub fn new(remote: Arc<Client>) -> Self {
        Self {
            tags: MonotoneTags::new(),
            remote,
            local: VersionedWrapper::new(Arc::new(InMemoryStore::new())),
            listener: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: std::sync::Mutex::new(Rendezvous {
                waiting: HashMap::new(),
                stopped: false,
            }),
            receive_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_change_listener(mut self, listener: ChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Launches the receive loop.
    pub fn start(self: &Arc<Self>) {
        let store = self.clone();
        let task = tokio::spawn(async move {
            store.receive_loop().await;
        });
        if let Ok(mut slot) = self.receive_task.lock() {
            *slot = Some(task);
        }
    }

    /// Stops the receive loop and closes the transport. Outstanding
    /// requests unblock through their timeout with `CancelledRendezvous`.
    pub async fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.stopped = true;
        }
        self.remote.close().await;
        let task = match self.receive_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            // The loop may be parked inside a receive deadline; there is
            // nothing worth finishing, so cut it down rather than wait the
            // deadline out.
            task.abort();
            let _ = task.await;
        }
    }

    fn stopped(&self) -> bool {
        self.state.lock().map(|state| state.stopped).unwrap_or(true)
    }

    fn new_rendezvous(&self, tag: u16) -> DinoResult<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self
            .state
            .lock()
            .map_err(|_| DinoError::StorageError("rendezvous lock poisoned".to_string()))?;
        if state.waiting.insert(tag, tx).is_some() {
            // A collision means 65535 requests in flight or a tag leak;
            // either way a programming error worth shouting about.
            error!("rendezvous collision on tag {}", tag);
        }
        Ok(rx)
    }

    fn cancel_rendezvous(&self, tag: u16) {
        if let Ok(mut state) = self.state.lock() {
            state.waiting.remove(&tag);
        }
    }

    fn do_rendezvous(&self, tag: u16, response: Message) {
        if let Ok(mut state) = self.state.lock() {
            match state.waiting.remove(&tag) {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!("response for no request? {}", response),
            }
        }
    }

    /// Sends a request and waits up to the request timeout for its
    /// response.
    async fn do_request(&self, request: Message) -> DinoResult<Message> {
        let tag = request.tag();
        let rx = self.new_rendezvous(tag)?;
        if let Err(err) = self.remote.send(&request).await {
            self.cancel_rendezvous(tag);
            return Err(err);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.cancel_rendezvous(tag);
                Err(DinoError::CancelledRendezvous)
            }
        }
    }

    async fn receive_loop(&self) {
        loop {
            if self.stopped() {
                break;
            }
            let m = match self.remote.receive().await {
                Ok(m) => m,
                Err(err) => {
                    if self.stopped() {
                        break;
                    }
                    if matches!(err, DinoError::Timeout(_)) {
                        // Nothing arrived within the socket deadline; the
                        // deadline itself was the backoff.
                        debug!("receive idle: {}", err);
                    } else {
                        error!("receive error: {}", err);
                        tokio::time::sleep(RECEIVE_BACKOFF).await;
                    }
                    continue;
                }
            };
            let tag = m.tag();
            if tag != BROADCAST_TAG {
                self.do_rendezvous(tag, m);
                continue;
            }
            if matches!(m, Message::Put { .. }) {
                let applied = apply_message(&self.local, &m).await;
                if let Message::Error { text, .. } = &applied {
                    error!("could not apply broadcast locally: {}", text);
                } else if let Some(listener) = &self.listener {
                    (listener.as_ref())(applied).await;
                }
            }
        }
    }
}

#[async_trait]
impl VersionedStore for RemoteVersionedStore {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let request = Message::Put {
            tag: self.tags.next(),
            key: key.to_vec(),
            value: value.to_vec(),
            version,
        };
        let response = self.do_request(request.clone()).await?;
        match response {
            Message::Put { .. } => {
                if response != request {
                    error!(
                        "request and response do not match: {} vs {}",
                        request, response
                    );
                    return Err(DinoError::RemoteError(
                        "request and response do not match".to_string(),
                    ));
                }
                Ok(())
            }
            Message::Error { text, .. } => {
                if text == DinoError::StalePut.to_string() {
                    Err(DinoError::StalePut)
                } else {
                    Err(DinoError::RemoteError(text))
                }
            }
            Message::Get { .. } => Err(DinoError::BadMessage(
                "unexpected get in response to put".to_string(),
            )),
        }
    }

    async fn get(&self, key: &[u8]) -> DinoResult<(u64, Vec<u8>)> {
        // The local cache is populated by broadcasts only; a hit means we
        // already know the latest version.
        if let Ok(found) = self.local.get(key).await {
            return Ok(found);
        }
        let request = Message::Get {
            tag: self.tags.next(),
            key: key.to_vec(),
        };
        match self.do_request(request).await? {
            Message::Put { version, value, .. } => Ok((version, value)),
            Message::Error { text, .. } => {
                if text.ends_with("not found") {
                    Err(DinoError::NotFound(hex::encode(key)))
                } else {
                    Err(DinoError::RemoteError(text))
                }
            }
            Message::Get { .. } => Err(DinoError::BadMessage(
                "unexpected get in response to get".to_string(),
            )),
        }
    }
}
