use std::net::SocketAddr;
use std::sync::Arc;

use dino_lib::{Decoder, DinoError, DinoResult, Encoder, Message, MonotoneTags};
use dino_store::{apply_message, VersionedStore};
use log::{debug, error, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ServerConn {
    id: u16,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<(Encoder, OwnedWriteHalf)>,
}

impl ServerConn {
    async fn send(&self, m: &Message) -> DinoResult<()> {
        let mut guard = self.writer.lock().await;
        let (encoder, writer) = &mut *guard;
        encoder.encode(writer, m).await
    }
}

/// The metadata broker. Accepts client connections, applies their get and
/// put messages to the authoritative versioned store, responds on the
/// originating connection, and fans accepted puts out, retagged to zero, to
/// every other connection.
pub struct Server {
    store: Arc<dyn VersionedStore>,
    conn_ids: MonotoneTags,
    listener: std::sync::Mutex<Option<TcpListener>>,
    // An async mutex on purpose: broadcasts hold it across their sends, so
    // fan-outs are serialized in acceptance order.
    conns: tokio::sync::Mutex<Vec<Arc<ServerConn>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(store: Arc<dyn VersionedStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            conn_ids: MonotoneTags::new(),
            listener: std::sync::Mutex::new(None),
            conns: tokio::sync::Mutex::new(Vec::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Binds the listening socket and returns the bound address (handy with
    /// port 0 in tests).
    pub async fn listen(&self, address: &str) -> DinoResult<SocketAddr> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| DinoError::IoError(format!("bind {}: {}", address, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DinoError::IoError(e.to_string()))?;
        let mut slot = self
            .listener
            .lock()
            .map_err(|_| DinoError::StorageError("listener lock poisoned".to_string()))?;
        *slot = Some(listener);
        Ok(addr)
    }

    /// Accepts connections until `shutdown` is called, spawning a decode
    /// loop per connection.
    pub async fn serve(self: &Arc<Self>) -> DinoResult<()> {
        let listener = {
            let mut slot = self
                .listener
                .lock()
                .map_err(|_| DinoError::StorageError("listener lock poisoned".to_string()))?;
            slot.take()
                .ok_or_else(|| DinoError::InvalidParam("serve called before listen".to_string()))?
        };
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.attach(stream, peer).await,
                        Err(err) => {
                            error!("accept: {}", err);
                            continue;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Instructs the server to shut down: stops accepting, closes every
    /// tracked connection, and tears down the per-connection decode loops.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.conns.lock().await.clear();
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.conn_ids.next();
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(ServerConn {
            id,
            peer,
            writer: tokio::sync::Mutex::new((Encoder::new(), write_half)),
        });
        info!("client {} attached from {}", id, peer);
        self.conns.lock().await.push(conn.clone());
        let server = self.clone();
        let task = tokio::spawn(async move {
            server.handle_input(conn, read_half).await;
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    // Runs on its own task; exits when the connection is closed or resets.
    async fn handle_input(self: Arc<Self>, conn: Arc<ServerConn>, mut reader: OwnedReadHalf) {
        let mut decoder = Decoder::new();
        loop {
            let input = match decoder.decode(&mut reader).await {
                Ok(Some(m)) => m,
                Ok(None) => {
                    info!("client {} ({}) detached", conn.id, conn.peer);
                    break;
                }
                Err(err) => {
                    warn!("client {} ({}): {}", conn.id, conn.peer, err);
                    break;
                }
            };
            let output = apply_message(self.store.as_ref(), &input).await;
            if let Err(err) = conn.send(&output).await {
                warn!("client {}: could not respond: {}", conn.id, err);
            }
            let accepted_put = matches!(input, Message::Put { .. })
                && matches!(output, Message::Put { .. });
            if accepted_put {
                let server = self.clone();
                let sender = conn.id;
                let broadcast = output.for_broadcast();
                tokio::spawn(async move {
                    server.broadcast(sender, broadcast).await;
                });
            }
        }
        // No longer handling input, so stop notifying this connection.
        self.remove_conn(conn.id).await;
    }

    async fn broadcast(&self, excluded: u16, m: Message) {
        // Re-encodes the message once per recipient; the connection list
        // lock is held across the sends so fan-outs do not interleave.
        let conns = self.conns.lock().await;
        for conn in conns.iter() {
            if conn.id == excluded {
                continue;
            }
            match conn.send(&m).await {
                // Never mind if a client missed the message; it is simply
                // more likely to send stale puts and read stale content.
                Err(err) => warn!(
                    "could not notify client {} of {}: {}",
                    conn.id, m, err
                ),
                Ok(()) => debug!("notified client {} of {}", conn.id, m),
            }
        }
    }

    async fn remove_conn(&self, id: u16) {
        let mut conns = self.conns.lock().await;
        conns.retain(|conn| conn.id != id);
    }
}
