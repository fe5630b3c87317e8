use std::sync::Arc;
use std::time::Duration;

use dino_lib::{Decoder, DinoError, DinoResult, Encoder, Message};
use log::debug;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

// Each half pairs the socket with the codec owned by that direction, so one
// lock serializes both the stream and the scratch buffer.
struct Halves {
    reader: Arc<Mutex<(Decoder, OwnedReadHalf)>>,
    writer: Arc<Mutex<(Encoder, OwnedWriteHalf)>>,
}

impl Clone for Halves {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            writer: self.writer.clone(),
        }
    }
}

/// A low-level metadata broker client that can send and receive wire
/// messages. Higher level clients, e.g. the remote versioned store, are
/// built on top of it.
///
/// The connection is dialed lazily: each send or receive uses the cached
/// connection if present, dialing otherwise. Timeouts surface as
/// `DinoError::Timeout` and keep the connection; any other network error
/// discards it so the next call redials.
pub struct Client {
    address: String,
    timeout: Duration,
    conn: Mutex<Option<Halves>>,
}

impl Client {
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_timeout(address, DEFAULT_CLIENT_TIMEOUT)
    }

    pub fn with_timeout(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Dials now instead of at the first send or receive. Useful to fail
    /// fast on a bad address at startup.
    pub async fn connect(&self) -> DinoResult<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Closes the cached connection, if any. The next call redials.
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if conn.take().is_some() {
            debug!("detached from {}", self.address);
        }
    }

    pub async fn send(&self, m: &Message) -> DinoResult<()> {
        let halves = self.ensure_connected().await?;
        let sent = tokio::time::timeout(self.timeout, async {
            let mut guard = halves.writer.lock().await;
            let (encoder, writer) = &mut *guard;
            encoder.encode(writer, m).await
        })
        .await;
        match sent {
            Err(_) => Err(DinoError::Timeout(format!("send to {}", self.address))),
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.close().await;
                Err(err)
            }
        }
    }

    pub async fn receive(&self) -> DinoResult<Message> {
        let halves = self.ensure_connected().await?;
        let received = tokio::time::timeout(self.timeout, async {
            let mut guard = halves.reader.lock().await;
            let (decoder, reader) = &mut *guard;
            decoder.decode(reader).await
        })
        .await;
        match received {
            Err(_) => Err(DinoError::Timeout(format!("receive from {}", self.address))),
            Ok(Ok(Some(m))) => Ok(m),
            Ok(Ok(None)) => {
                self.close().await;
                Err(DinoError::IoError(format!(
                    "{}: connection closed by peer",
                    self.address
                )))
            }
            Ok(Err(err)) => {
                self.close().await;
                Err(err)
            }
        }
    }

    async fn ensure_connected(&self) -> DinoResult<Halves> {
        let mut conn = self.conn.lock().await;
        if let Some(halves) = conn.as_ref() {
            return Ok(halves.clone());
        }
        let stream = TcpStream::connect(self.address.as_str())
            .await
            .map_err(|e| DinoError::IoError(format!("dial {}: {}", self.address, e)))?;
        debug!("attached to {}", self.address);
        let (read_half, write_half) = stream.into_split();
        let halves = Halves {
            reader: Arc::new(Mutex::new((Decoder::new(), read_half))),
            writer: Arc::new(Mutex::new((Encoder::new(), write_half))),
        };
        *conn = Some(halves.clone());
        Ok(halves)
    }
}
