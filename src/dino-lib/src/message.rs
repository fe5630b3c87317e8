//! Wire messages exchanged with the metadata broker, and their streaming
//! codec.
//!
//! A get asks the broker for the latest version of a key's value. A put
//! updates a key at a new version; the broker echoes accepted puts back to
//! the sender and fans them out, retagged to zero, to every other client.
//! An error message only flows from the broker to a client, in response to
//! an unknown key or a stale put.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{bits, DinoError, DinoResult};

const KIND_GET: u8 = 0;
const KIND_PUT: u8 = 1;
const KIND_ERROR: u8 = 2;

/// The tag reserved for broadcast messages, which are not responses to any
/// request. Request tags are 1..=65535.
pub const BROADCAST_TAG: u16 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Get {
        tag: u16,
        key: Vec<u8>,
    },
    Put {
        tag: u16,
        key: Vec<u8>,
        value: Vec<u8>,
        version: u64,
    },
    Error {
        tag: u16,
        text: String,
    },
}

impl Message {
    /// The tag correlating requests with responses for a given client.
    pub fn tag(&self) -> u16 {
        match self {
            Message::Get { tag, .. } => *tag,
            Message::Put { tag, .. } => *tag,
            Message::Error { tag, .. } => *tag,
        }
    }

    /// A copy of a put message suitable for fan-out to other connections.
    /// Only puts are ever broadcast; other kinds come back unchanged.
    pub fn for_broadcast(&self) -> Message {
        match self {
            Message::Put {
                key,
                value,
                version,
                ..
            } => Message::Put {
                tag: BROADCAST_TAG,
                key: key.clone(),
                value: value.clone(),
                version: *version,
            },
            other => other.clone(),
        }
    }
}

// Keys and values are shown in hex when they contain anything unprintable,
// and clipped at 11 characters either way.
fn repr(b: &[u8]) -> String {
    const MAX: usize = 11;
    let printable = b.iter().all(|c| c.is_ascii_graphic() || *c == b' ');
    let s = if printable {
        String::from_utf8_lossy(b).into_owned()
    } else {
        hex::encode(b)
    };
    if s.len() > MAX {
        format!("{}...", &s[..MAX - 3])
    } else {
        s
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Get { tag, key } => {
                write!(f, "kind=GET tag={} key={}", tag, repr(key))
            }
            Message::Put {
                tag,
                key,
                value,
                version,
            } => write!(
                f,
                "kind=PUT tag={} key={} value={} version={}",
                tag,
                repr(key),
                repr(value),
                version
            ),
            Message::Error { tag, text } => {
                write!(f, "kind=ERROR tag={} text={}", tag, repr(text.as_bytes()))
            }
        }
    }
}

/// Streaming message encoder with a reusable scratch buffer. Not safe for
/// concurrent use; callers serialize access per connection direction.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn encode<W>(&mut self, w: &mut W, m: &Message) -> DinoResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.buf.clear();
        match m {
            Message::Get { tag, key } => {
                bits::put8(&mut self.buf, KIND_GET);
                bits::put16(&mut self.buf, *tag);
                bits::put_bytes(&mut self.buf, key);
            }
            Message::Put {
                tag,
                key,
                value,
                version,
            } => {
                bits::put8(&mut self.buf, KIND_PUT);
                bits::put16(&mut self.buf, *tag);
                bits::put_bytes(&mut self.buf, key);
                bits::put_bytes(&mut self.buf, value);
                bits::put64(&mut self.buf, *version);
            }
            Message::Error { tag, text } => {
                bits::put8(&mut self.buf, KIND_ERROR);
                bits::put16(&mut self.buf, *tag);
                bits::put_str(&mut self.buf, text);
            }
        }
        w.write_all(&self.buf).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::WriteZero => DinoError::Underflow(e.to_string()),
            _ => DinoError::IoError(e.to_string()),
        })?;
        Ok(())
    }
}

/// Streaming message decoder with a reusable scratch buffer. Not safe for
/// concurrent use. Reads a fixed 5-byte header (kind, tag, first length)
/// and then the kind-specific remainder.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next message from the stream. Returns `Ok(None)` on a
    /// clean end of stream (the peer closed between messages); a stream
    /// that ends mid-frame yields `Underflow`, which receivers treat as
    /// connection-fatal.
    pub async fn decode<R>(&mut self, r: &mut R) -> DinoResult<Option<Message>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut first = [0u8; 1];
        let n = r
            .read(&mut first)
            .await
            .map_err(|e| DinoError::IoError(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        let kind = first[0];
        self.fill(r, 4).await?;
        let tag = u16::from_le_bytes([self.buf[0], self.buf[1]]);
        let n = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        let m = match kind {
            KIND_GET => {
                self.fill(r, n).await?;
                Message::Get {
                    tag,
                    key: self.buf[..n].to_vec(),
                }
            }
            KIND_PUT => {
                self.fill(r, n + 2).await?;
                let key = self.buf[..n].to_vec();
                let vlen =
                    u16::from_le_bytes([self.buf[n], self.buf[n + 1]]) as usize;
                self.fill(r, vlen + 8).await?;
                let value = self.buf[..vlen].to_vec();
                let (version, _) = bits::get64(&self.buf[vlen..vlen + 8])?;
                Message::Put {
                    tag,
                    key,
                    value,
                    version,
                }
            }
            KIND_ERROR => {
                self.fill(r, n).await?;
                let text = String::from_utf8_lossy(&self.buf[..n]).into_owned();
                Message::Error { tag, text }
            }
            other => {
                return Err(DinoError::BadMessage(format!(
                    "unknown message kind: {}",
                    other
                )))
            }
        };
        Ok(Some(m))
    }

    async fn fill<R>(&mut self, r: &mut R, n: usize) -> DinoResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.buf.resize(n, 0);
        r.read_exact(&mut self.buf[..n])
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    DinoError::Underflow(format!("wanted {} bytes: {}", n, e))
                }
                _ => DinoError::IoError(e.to_string()),
            })?;
        Ok(())
    }
}
