use dino_lib::Message;
use log::debug;

use crate::{short_key, VersionedStore};

/// Applies a get or put message to a versioned store and returns the
/// response to send back: a put echo on success, an error message carrying
/// the failure text otherwise. The same dispatch serves the broker's
/// authoritative store and each client's local cache of broadcasts.
pub async fn apply_message(store: &dyn VersionedStore, input: &Message) -> Message {
    match input {
        Message::Get { tag, key } => match store.get(key).await {
            Ok((version, value)) => Message::Put {
                tag: *tag,
                key: key.clone(),
                value,
                version,
            },
            Err(err) => Message::Error {
                tag: *tag,
                text: err.to_string(),
            },
        },
        Message::Put {
            tag,
            key,
            value,
            version,
        } => match store.put(*version, key, value).await {
            Ok(()) => {
                debug!("applied put message key={} version={}", short_key(key), version);
                input.clone()
            }
            Err(err) => Message::Error {
                tag: *tag,
                text: err.to_string(),
            },
        },
        Message::Error { tag, .. } => Message::Error {
            tag: *tag,
            text: "error messages cannot be applied".to_string(),
        },
    }
}
