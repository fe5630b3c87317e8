mod apply;
mod blob;
mod bucket;
mod disk;
mod http;
mod memory;
mod paired;
mod sqlite;
mod store;

pub use apply::*;
pub use blob::*;
pub use bucket::*;
pub use disk::*;
pub use http::*;
pub use memory::*;
pub use paired::*;
pub use sqlite::*;
pub use store::*;

#[cfg(test)]
mod store_tests;

/// Clipped hex rendering of a key for log lines.
pub(crate) fn short_key(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(5)])
}
