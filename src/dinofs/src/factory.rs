use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use dino_lib::{DinoError, DinoResult, Message};
use dino_store::{BlobStore, VersionedStore};
use log::debug;
use rand::RngCore;

use crate::ino::InodeNumbers;
use crate::node::{new_node_state, Node, NodeKey, MODE_NOT_LOADED, NODE_KEY_LEN};

/// Creates nodes with fresh random keys, injects the shared stores, and
/// keeps the process-wide index of live nodes by key (the known-set), so
/// that change notifications from the metadata broker can be routed to the
/// node they concern.
///
/// The known-set only indexes nodes; ownership lies with the inode table
/// and with each parent directory's children map.
pub struct NodeFactory {
    pub(crate) metadata: Arc<dyn VersionedStore>,
    pub(crate) blobs: Arc<BlobStore>,
    inodes: InodeNumbers,
    known: Mutex<HashMap<NodeKey, Weak<Node>>>,
    by_ino: Mutex<HashMap<u64, Arc<Node>>>,
}

impl NodeFactory {
    pub fn new(metadata: Arc<dyn VersionedStore>, blobs: Arc<BlobStore>) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            blobs,
            inodes: InodeNumbers::new(),
            known: Mutex::new(HashMap::new()),
            by_ino: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates a node with a fresh random key, registered in the
    /// known-set.
    pub fn alloc_node(self: &Arc<Self>) -> DinoResult<Arc<Node>> {
        let mut key: NodeKey = [0; NODE_KEY_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| DinoError::StorageError(format!("could not draw a node key: {}", e)))?;
        let node = Node::new(Arc::downgrade(self), key, new_node_state());
        self.add_known(&node);
        Ok(node)
    }

    /// Returns the live node for a known key, or a not-yet-loaded sentinel
    /// to be resolved lazily. There is at most one live node per key
    /// process-wide.
    pub fn existing_node(self: &Arc<Self>, name: impl Into<String>, key: NodeKey) -> Arc<Node> {
        let name = name.into();
        if let Some(node) = self.get_known(&key) {
            return node;
        }
        let mut state = new_node_state();
        state.name = name;
        state.mode = MODE_NOT_LOADED;
        let node = Node::new(Arc::downgrade(self), key, state);
        self.add_known(&node);
        node
    }

    fn add_known(&self, node: &Arc<Node>) {
        let Ok(mut known) = self.known.lock() else {
            return;
        };
        let key = node.key();
        known.entry(key).or_insert_with(|| {
            debug!("discovered node {}", hex::encode(&key[..5]));
            Arc::downgrade(node)
        });
    }

    pub(crate) fn get_known(&self, key: &NodeKey) -> Option<Arc<Node>> {
        let mut known = self.known.lock().ok()?;
        match known.get(key).and_then(Weak::upgrade) {
            Some(node) => Some(node),
            None => {
                // The node is gone (or was never there); drop a dead entry
                // so the slot can be reused.
                known.remove(key);
                None
            }
        }
    }

    // A remote rename can change the key a name resolves to; the live node
    // keeps its identity and moves to the new slot in the index.
    pub(crate) fn rekey(&self, node: &Arc<Node>, old_key: NodeKey, new_key: NodeKey) {
        if let Ok(mut known) = self.known.lock() {
            known.remove(&old_key);
            known.entry(new_key).or_insert_with(|| Arc::downgrade(node));
        }
    }

    pub(crate) fn next_ino(&self) -> u64 {
        self.inodes.next()
    }

    /// Registers a node in the kernel-bridge inode table. Idempotent.
    pub fn register_ino(&self, ino: u64, node: Arc<Node>) {
        if let Ok(mut by_ino) = self.by_ino.lock() {
            by_ino.entry(ino).or_insert(node);
        }
    }

    pub fn forget_ino(&self, ino: u64) {
        if let Ok(mut by_ino) = self.by_ino.lock() {
            by_ino.remove(&ino);
        }
    }

    pub fn node_by_ino(&self, ino: u64) -> Option<Arc<Node>> {
        self.by_ino.lock().ok()?.get(&ino).cloned()
    }

    /// The change-notification entry point: marks the node a broadcast
    /// refers to, if it is live, as needing a metadata reload. Notifications
    /// for unknown keys and notifications at or below the node's current
    /// version are discarded.
    pub async fn invalidate_cache(&self, mutation: Message) {
        let Message::Put { key, version, .. } = &mutation else {
            return;
        };
        if key.len() != NODE_KEY_LEN {
            debug!("not updating (not a metadata key): {}", mutation);
            return;
        }
        let mut node_key: NodeKey = [0; NODE_KEY_LEN];
        node_key.copy_from_slice(key);
        let Some(node) = self.get_known(&node_key) else {
            debug!("not updating (unknown node): {}", mutation);
            return;
        };
        let mut state = node.state.lock().await;
        if *version <= state.version {
            debug!(
                "not updating (stale update, local version {}): {}",
                state.version, mutation
            );
            return;
        }
        debug!("marking {} for update", state.name);
        state.should_reload_metadata = true;
    }
}
