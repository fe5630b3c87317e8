//! Node metadata serialization and persistence.
//!
//! The on-disk layout is little-endian throughout: `user(4) group(4)
//! mode(4) time_ns(8)`, the length-prefixed content key, a u16 count of
//! extended attributes followed by length-prefixed name/value pairs, and
//! the remaining bytes as length-prefixed child name/key pairs.

use std::collections::HashMap;

use dino_lib::{bits, DinoError, DinoResult};
use log::error;

use crate::node::{Node, NodeKey, NodeState, S_IFDIR, S_IFMT, NODE_KEY_LEN};

/// The persisted fields of a node, parsed from a metadata blob. Applying a
/// record to live state is the caller's business: a fresh load turns child
/// entries into nodes through the factory, whereas a reload reconciles them
/// against children already in memory.
pub(crate) struct NodeRecord {
    pub(crate) user: u32,
    pub(crate) group: u32,
    pub(crate) mode: u32,
    pub(crate) time_ns: u64,
    pub(crate) content_key: Vec<u8>,
    pub(crate) xattrs: HashMap<String, Vec<u8>>,
    pub(crate) children: HashMap<String, NodeKey>,
}

impl NodeRecord {
    pub(crate) fn unserialize(raw: &[u8]) -> DinoResult<NodeRecord> {
        let (user, b) = bits::get32(raw)?;
        let (group, b) = bits::get32(b)?;
        let (mode, b) = bits::get32(b)?;
        let (time_ns, b) = bits::get64(b)?;
        let (content_key, b) = bits::get_bytes(b)?;
        let (nxattrs, mut b) = bits::get16(b)?;
        let mut xattrs = HashMap::new();
        for _ in 0..nxattrs {
            let (attr, rest) = bits::get_str(b)?;
            let (value, rest) = bits::get_bytes(rest)?;
            xattrs.insert(attr, value);
            b = rest;
        }
        let mut children = HashMap::new();
        while !b.is_empty() {
            let (child_name, rest) = bits::get_str(b)?;
            let (child_key, rest) = bits::get_bytes(rest)?;
            if child_key.len() != NODE_KEY_LEN {
                return Err(DinoError::DecodeError(format!(
                    "child {} has a key of {} bytes",
                    child_name,
                    child_key.len()
                )));
            }
            let mut key: NodeKey = [0; NODE_KEY_LEN];
            key.copy_from_slice(&child_key);
            children.insert(child_name, key);
            b = rest;
        }
        Ok(NodeRecord {
            user,
            group,
            mode,
            time_ns,
            content_key,
            xattrs,
            children,
        })
    }
}

pub(crate) fn serialize(state: &NodeState) -> Vec<u8> {
    let mut size = 24 + state.content_key.len();
    for (attr, value) in &state.xattrs {
        size += 4 + attr.len() + value.len();
    }
    for child_name in state.children.keys() {
        size += 4 + NODE_KEY_LEN + child_name.len();
    }
    let mut buf = Vec::with_capacity(size);
    bits::put32(&mut buf, state.user);
    bits::put32(&mut buf, state.group);
    bits::put32(&mut buf, state.mode);
    bits::put64(&mut buf, state.time_ns);
    bits::put_bytes(&mut buf, &state.content_key);
    bits::put16(&mut buf, state.xattrs.len() as u16);
    for (attr, value) in &state.xattrs {
        bits::put_str(&mut buf, attr);
        bits::put_bytes(&mut buf, value);
    }
    for (child_name, child) in &state.children {
        bits::put_str(&mut buf, child_name);
        bits::put_bytes(&mut buf, &child.key());
    }
    buf
}

impl Node {
    // Call with the lock held.
    pub(crate) async fn save_metadata(&self, state: &mut NodeState) -> DinoResult<()> {
        let value = serialize(state);
        let factory = self.factory()?;
        let key = self.key();
        factory.metadata.put(state.version + 1, &key, &value).await?;
        state.version += 1;
        Ok(())
    }

    // Call with the lock held. Fetches and applies the metadata stored
    // under the given key; for directories, the child entries become live
    // or sentinel nodes through the factory.
    pub(crate) async fn load_metadata(
        &self,
        state: &mut NodeState,
        key: NodeKey,
    ) -> DinoResult<()> {
        let factory = self.factory()?;
        let (version, raw) = factory.metadata.get(&key).await?;
        let record = NodeRecord::unserialize(&raw)?;
        self.set_key(key);
        state.version = version;
        state.user = record.user;
        state.group = record.group;
        state.mode = record.mode;
        state.time_ns = record.time_ns;
        state.content_key = record.content_key;
        state.xattrs = record.xattrs;
        if state.mode & S_IFMT == S_IFDIR {
            state.children = record
                .children
                .into_iter()
                .map(|(child_name, child_key)| {
                    let child = factory.existing_node(child_name.clone(), child_key);
                    (child_name, child)
                })
                .collect();
        }
        Ok(())
    }

    /// Loads the node's metadata from the versioned store. Used on the boot
    /// path for the root node.
    pub async fn load(&self, key: NodeKey) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        self.load_metadata(&mut state, key).await
    }

    // Call with the lock held. Persists dirty content first (a changed
    // digest dirties the metadata), then dirty metadata at the next
    // version.
    pub(crate) async fn sync(&self, state: &mut NodeState) -> DinoResult<()> {
        if state.should_save_content {
            let factory = self.factory()?;
            let new_key = match factory.blobs.put(&state.content).await {
                Ok(new_key) => new_key,
                Err(err) => {
                    error!("could not save content for {}: {}", state.name, err);
                    return Err(err);
                }
            };
            state.should_save_content = false;
            if new_key != state.content_key {
                state.content_key = new_key;
                state.should_save_metadata = true;
            }
        }
        if state.should_save_metadata {
            if let Err(err) = self.save_metadata(state).await {
                error!("could not save metadata for {}: {}", state.name, err);
                return Err(err);
            }
            state.should_save_metadata = false;
        }
        Ok(())
    }
}
