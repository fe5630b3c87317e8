use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use dino_lib::{DinoError, DinoResult};
use log::{error, warn};

use crate::factory::NodeFactory;

pub const NODE_KEY_LEN: usize = 20;

/// A node's key in the metadata store: a sort of inode number, except it is
/// not assigned by a central entity and is never reused.
pub type NodeKey = [u8; NODE_KEY_LEN];

/// Sentinel mode meaning the key is known but the metadata has not been
/// fetched yet.
pub const MODE_NOT_LOADED: u32 = 0xffff_ffff;

/// The filesystem root is stored under the all-zero key.
pub const ROOT_KEY: NodeKey = [0; NODE_KEY_LEN];

pub(crate) const S_IFMT: u32 = libc::S_IFMT as u32;
pub(crate) const S_IFREG: u32 = libc::S_IFREG as u32;
pub(crate) const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub(crate) const S_IFLNK: u32 = libc::S_IFLNK as u32;

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn is_file_like(mode: u32) -> bool {
    let fmt = mode & S_IFMT;
    fmt == S_IFREG || fmt == S_IFLNK
}

/// The mutable half of a node, everything guarded by the node lock.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) should_save_metadata: bool,
    pub(crate) should_reload_metadata: bool,
    pub(crate) should_save_content: bool,

    pub(crate) user: u32,
    pub(crate) group: u32,
    pub(crate) mode: u32,
    pub(crate) time_ns: u64,

    // Not persisted, only for logging.
    pub(crate) name: String,

    /// Increases by one at each update, by any client connected to the
    /// metadata broker.
    pub(crate) version: u64,

    pub(crate) xattrs: HashMap<String, Vec<u8>>,

    // Only meaningful for regular files and symlinks. Content is loaded
    // lazily and flushed through the blob store on sync.
    pub(crate) content_key: Vec<u8>,
    pub(crate) content: Vec<u8>,

    // Only meaningful for directories.
    pub(crate) children: HashMap<String, Arc<Node>>,
}

pub(crate) fn new_node_state() -> NodeState {
    NodeState {
        should_save_metadata: false,
        should_reload_metadata: false,
        should_save_content: false,
        user: 0,
        group: 0,
        mode: 0,
        time_ns: now_ns(),
        name: String::new(),
        version: 0,
        xattrs: HashMap::new(),
        content_key: Vec::new(),
        content: Vec::new(),
        children: HashMap::new(),
    }
}

/// An in-memory filesystem node: a regular file, directory, or symlink.
///
/// All public operations lock the node first, and hold the lock across the
/// store round trips they entail. The cross-node operation, rename,
/// additionally locks the new parent (skipped when it is the same node) and
/// then the moving child.
#[derive(Debug)]
pub struct Node {
    pub(crate) factory: Weak<NodeFactory>,
    // The key is outside the state lock so a parent serializing its
    // children can read it without taking each child's lock. It only
    // changes during reload reconciliation, under the parent's lock.
    key: Mutex<NodeKey>,
    ino: AtomicU64,
    pub(crate) state: tokio::sync::Mutex<NodeState>,
}

/// Snapshot of the attributes the kernel bridge reports.
#[derive(Clone, Copy, Debug)]
pub struct NodeAttr {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub user: u32,
    pub group: u32,
    pub time_ns: u64,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub ino: u64,
    pub mode: u32,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetxattrFlags {
    Default,
    Create,
    Replace,
}

/// The attribute changes a setattr request may carry; untouched fields are
/// `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetattrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime_ns: Option<u64>,
}

impl Node {
    pub(crate) fn new(factory: Weak<NodeFactory>, key: NodeKey, state: NodeState) -> Arc<Self> {
        Arc::new(Self {
            factory,
            key: Mutex::new(key),
            ino: AtomicU64::new(0),
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub(crate) fn factory(&self) -> DinoResult<Arc<NodeFactory>> {
        self.factory
            .upgrade()
            .ok_or_else(|| DinoError::StorageError("node factory dropped".to_string()))
    }

    pub fn key(&self) -> NodeKey {
        self.key.lock().map(|key| *key).unwrap_or([0; NODE_KEY_LEN])
    }

    pub(crate) fn set_key(&self, key: NodeKey) {
        if let Ok(mut slot) = self.key.lock() {
            *slot = key;
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ino(&self, ino: u64) {
        self.ino.store(ino, Ordering::Relaxed);
    }

    /// Turns this node into an empty directory, for serving a filesystem
    /// whose root has never been written.
    pub async fn bootstrap_empty_dir(&self) {
        let mut state = self.state.lock().await;
        state.mode = S_IFDIR | 0o755;
        state.should_reload_metadata = false;
        state.children.clear();
    }

    // ------------------------------------------------------------------
    // Read path and coherence

    pub async fn lookup(&self, name: &str) -> DinoResult<Arc<Node>> {
        let mut state = self.state.lock().await;
        self.reload_if_needed(&mut state).await?;
        let child = state
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| DinoError::NotFound(name.to_string()))?;
        self.ensure_child_loaded(&child).await?;
        Ok(child)
    }

    pub async fn opendir(&self) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        self.reload_if_needed(&mut state).await?;
        let children: Vec<Arc<Node>> = state.children.values().cloned().collect();
        for child in children {
            self.ensure_child_loaded(&child).await?;
        }
        Ok(())
    }

    pub async fn readdir(&self) -> DinoResult<Vec<DirEntry>> {
        let mut state = self.state.lock().await;
        self.reload_if_needed(&mut state).await?;
        let mut entries = Vec::with_capacity(state.children.len());
        for (name, child) in &state.children {
            self.ensure_child_loaded(child).await?;
            let child_state = child.state.lock().await;
            entries.push(DirEntry {
                ino: child.ino(),
                mode: child_state.mode,
                name: name.clone(),
            });
        }
        Ok(entries)
    }

    pub async fn getattr(&self) -> DinoResult<NodeAttr> {
        let mut state = self.state.lock().await;
        self.reload_if_needed(&mut state).await?;
        self.ensure_content_loaded(&mut state).await?;
        Ok(NodeAttr {
            ino: self.ino(),
            size: state.content.len() as u64,
            mode: state.mode,
            user: state.user,
            group: state.group,
            time_ns: state.time_ns,
        })
    }

    pub async fn open(&self) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        self.reload_if_needed(&mut state).await?;
        self.ensure_content_loaded(&mut state).await
    }

    // Call with the parent lock held. Resolves a not-yet-loaded child and
    // registers it with the kernel bridge under a fresh inode number.
    async fn ensure_child_loaded(&self, child: &Arc<Node>) -> DinoResult<()> {
        let factory = self.factory()?;
        let mut child_state = child.state.lock().await;
        if child_state.mode == MODE_NOT_LOADED {
            let key = child.key();
            if let Err(err) = child.load_metadata(&mut child_state, key).await {
                error!(
                    "could not load metadata for child {}: {}",
                    child_state.name, err
                );
                // A child we hold an entry for but cannot load is a storage
                // problem, not a missing name.
                return Err(DinoError::StorageError(err.to_string()));
            }
        }
        if child.ino() == 0 {
            child.set_ino(factory.next_ino());
        }
        factory.register_ino(child.ino(), child.clone());
        Ok(())
    }

    // Call with the lock held. Re-reads this node's metadata from the
    // versioned store and reconciles it against the in-memory state.
    pub(crate) async fn reload_if_needed(&self, state: &mut NodeState) -> DinoResult<()> {
        if !state.should_reload_metadata {
            return Ok(());
        }
        let factory = self.factory()?;
        let key = self.key();
        let (version, raw) = factory.metadata.get(&key).await.map_err(|err| {
            error!("could not reload {}: {}", state.name, err);
            DinoError::StorageError(err.to_string())
        })?;
        let record = crate::metadata::NodeRecord::unserialize(&raw)?;
        state.should_save_metadata = false;
        state.should_reload_metadata = false;
        state.should_save_content = false;
        state.user = record.user;
        state.group = record.group;
        state.mode = record.mode;
        state.time_ns = record.time_ns;
        state.version = version;
        state.xattrs = record.xattrs;
        if state.content_key != record.content_key {
            state.content_key = record.content_key;
            state.content.clear();
        }

        // Children are by far the hardest part to reload. A child that kept
        // its key is left alone; a child whose key changed keeps its node
        // object but is marked for its own reload; a new name gets a
        // sentinel for lazy resolution; a vanished name is dropped from
        // both the children map and the kernel-bridge table.
        for (name, child_key) in &record.children {
            match state.children.get(name) {
                Some(prev) => {
                    let prev_key = prev.key();
                    if prev_key != *child_key {
                        factory.rekey(prev, prev_key, *child_key);
                        prev.set_key(*child_key);
                        prev.state.lock().await.should_reload_metadata = true;
                    }
                }
                None => {
                    let child = factory.existing_node(name.clone(), *child_key);
                    state.children.insert(name.clone(), child);
                }
            }
        }
        let removed: Vec<String> = state
            .children
            .keys()
            .filter(|name| !record.children.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(child) = state.children.remove(&name) {
                if child.ino() != 0 {
                    factory.forget_ino(child.ino());
                }
            }
        }
        Ok(())
    }

    // Call with the lock held.
    pub(crate) async fn ensure_content_loaded(&self, state: &mut NodeState) -> DinoResult<()> {
        if state.should_save_content {
            return Ok(());
        }
        if !is_file_like(state.mode) {
            return Ok(());
        }
        if state.content_key.is_empty() {
            return Ok(());
        }
        if !state.content.is_empty() {
            return Ok(());
        }
        let factory = self.factory()?;
        let value = factory.blobs.get(&state.content_key).await.map_err(|err| {
            error!("could not load content for {}: {}", state.name, err);
            err
        })?;
        state.content = value;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Content byte arithmetic

    pub async fn read(&self, offset: u64, size: u32) -> Vec<u8> {
        let state = self.state.lock().await;
        let len = state.content.len() as u64;
        if offset >= len {
            return Vec::new();
        }
        let end = (offset + size as u64).min(len);
        state.content[offset as usize..end as usize].to_vec()
    }

    pub async fn write(&self, data: &[u8], offset: u64) -> u32 {
        let mut state = self.state.lock().await;
        let end = offset as usize + data.len();
        if end > state.content.len() {
            state.content.resize(end, 0);
        }
        state.content[offset as usize..end].copy_from_slice(data);
        state.time_ns = now_ns();
        if !data.is_empty() {
            state.should_save_content = true;
        }
        data.len() as u32
    }

    pub async fn readlink(&self) -> DinoResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        self.ensure_content_loaded(&mut state).await?;
        Ok(state.content.clone())
    }

    // ------------------------------------------------------------------
    // Mutations, each with rollback on storage failure

    pub async fn setxattr(
        &self,
        attr: &str,
        data: &[u8],
        flags: SetxattrFlags,
    ) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        match flags {
            SetxattrFlags::Create => {
                if state.xattrs.contains_key(attr) {
                    return Err(DinoError::AlreadyExists(attr.to_string()));
                }
            }
            SetxattrFlags::Replace => {
                if !state.xattrs.contains_key(attr) {
                    return Err(DinoError::NoData(attr.to_string()));
                }
            }
            SetxattrFlags::Default => {}
        }
        let rollback = state.xattrs.insert(attr.to_string(), data.to_vec());
        state.should_save_metadata = true;
        if let Err(err) = self.sync(&mut state).await {
            match rollback {
                Some(previous) => {
                    state.xattrs.insert(attr.to_string(), previous);
                }
                None => {
                    state.xattrs.remove(attr);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn getxattr(&self, attr: &str) -> DinoResult<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .xattrs
            .get(attr)
            .cloned()
            .ok_or_else(|| DinoError::NoData(attr.to_string()))
    }

    pub async fn listxattr(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.xattrs.keys().cloned().collect()
    }

    pub async fn rmdir(&self, name: &str) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        let child = match state.children.get(name).cloned() {
            Some(child) => child,
            None => {
                // The kernel bridge should only ask to remove directories
                // it has looked up; don't panic the mount over it.
                warn!("asked to remove directory that does not exist: {}", name);
                return Err(DinoError::NotFound(name.to_string()));
            }
        };
        let child_state = child.state.lock().await;
        if !child_state.children.is_empty() {
            return Err(DinoError::NotEmpty(name.to_string()));
        }
        state.children.remove(name);
        state.should_save_metadata = true;
        if let Err(err) = self.sync(&mut state).await {
            state.children.insert(name.to_string(), child.clone());
            return Err(err);
        }
        Ok(())
    }

    pub async fn unlink(&self, name: &str) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        let child = state.children.remove(name);
        state.should_save_metadata = true;
        if let Err(err) = self.sync(&mut state).await {
            if let Some(child) = child {
                state.children.insert(name.to_string(), child);
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn create(&self, name: &str, mode: u32) -> DinoResult<Arc<Node>> {
        let mut state = self.state.lock().await;
        let (child, ino) = self.new_locked_child(&mut state, name, mode | S_IFREG).await?;
        {
            let mut child_state = child.state.lock().await;
            child_state.should_save_metadata = true;
        }
        self.commit_new_child(&mut state, name, &child, ino).await?;
        Ok(child)
    }

    pub async fn mkdir(&self, name: &str, mode: u32) -> DinoResult<Arc<Node>> {
        let mut state = self.state.lock().await;
        let (child, ino) = self.new_locked_child(&mut state, name, mode | S_IFDIR).await?;
        {
            let mut child_state = child.state.lock().await;
            child_state.should_save_metadata = true;
        }
        self.commit_new_child(&mut state, name, &child, ino).await?;
        Ok(child)
    }

    pub async fn symlink(&self, target: &str, name: &str) -> DinoResult<Arc<Node>> {
        let mut state = self.state.lock().await;
        let (child, ino) = self.new_locked_child(&mut state, name, S_IFLNK).await?;
        {
            let mut child_state = child.state.lock().await;
            child_state.content = target.as_bytes().to_vec();
            child_state.should_save_content = true;
            child_state.should_save_metadata = true;
        }
        self.commit_new_child(&mut state, name, &child, ino).await?;
        Ok(child)
    }

    // Call with the parent lock held: allocates the child, hooks it into
    // the children map, and registers it with the kernel bridge.
    async fn new_locked_child(
        &self,
        state: &mut NodeState,
        name: &str,
        mode: u32,
    ) -> DinoResult<(Arc<Node>, u64)> {
        let factory = self.factory()?;
        let child = factory.alloc_node().map_err(|err| {
            error!("could not create child {}: {}", name, err);
            err
        })?;
        {
            let mut child_state = child.state.lock().await;
            child_state.name = name.to_string();
            child_state.mode = mode;
        }
        state.children.insert(name.to_string(), child.clone());
        let ino = factory.next_ino();
        child.set_ino(ino);
        factory.register_ino(ino, child.clone());
        Ok((child, ino))
    }

    // Commits the child's metadata first (at version one), then the parent
    // entry pointing at it. On either failure the child is unhooked from
    // the parent map and the kernel bridge; its possibly-written metadata
    // blob is abandoned.
    async fn commit_new_child(
        &self,
        state: &mut NodeState,
        name: &str,
        child: &Arc<Node>,
        ino: u64,
    ) -> DinoResult<()> {
        let factory = self.factory()?;
        {
            let mut child_state = child.state.lock().await;
            if let Err(err) = child.sync(&mut child_state).await {
                state.children.remove(name);
                factory.forget_ino(ino);
                return Err(err);
            }
        }
        state.should_save_metadata = true;
        if let Err(err) = self.sync(state).await {
            state.children.remove(name);
            factory.forget_ino(ino);
            return Err(err);
        }
        Ok(())
    }

    pub async fn flush(&self) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        let previous = state.content_key.clone();
        if let Err(err) = self.sync(&mut state).await {
            if state.content_key != previous {
                state.content_key = previous;
                state.content.clear();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Durability is the sync-on-flush contract; there is nothing more to
    /// do here.
    pub async fn fsync(&self) -> DinoResult<()> {
        Ok(())
    }

    pub async fn setattr(&self, changes: SetattrChanges) -> DinoResult<()> {
        let mut state = self.state.lock().await;
        let mut rb_time = None;
        let mut rb_user = None;
        let mut rb_group = None;
        let mut rb_mode = None;
        let mut rb_content: Option<Vec<u8>> = None;

        if let Some(mtime_ns) = changes.mtime_ns {
            rb_time = Some(state.time_ns);
            state.time_ns = mtime_ns;
        }
        if let Some(uid) = changes.uid {
            rb_user = Some(state.user);
            state.user = uid;
        }
        if let Some(gid) = changes.gid {
            rb_group = Some(state.group);
            state.group = gid;
        }
        if let Some(mode) = changes.mode {
            rb_mode = Some(state.mode);
            state.mode = state.mode & 0xffff_f000 | mode & 0x0000_0fff;
        }
        if let Some(size) = changes.size {
            rb_content = Some(state.content.clone());
            state.content.resize(size as usize, 0);
            state.time_ns = now_ns();
            state.should_save_content = true;
        }
        state.should_save_metadata = true;
        if let Err(err) = self.sync(&mut state).await {
            if let Some(time_ns) = rb_time {
                state.time_ns = time_ns;
            }
            if let Some(user) = rb_user {
                state.user = user;
            }
            if let Some(group) = rb_group {
                state.group = group;
            }
            if let Some(mode) = rb_mode {
                state.mode = mode;
            }
            if let Some(content) = rb_content {
                state.content = content;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Moves a child under a (possibly different) parent. Not atomic across
    /// the three nodes involved: the child, the new parent, and the old
    /// parent are written in that order and the first error is returned
    /// without rollback.
    pub async fn rename(
        self: &Arc<Self>,
        name: &str,
        new_parent: &Arc<Node>,
        new_name: &str,
    ) -> DinoResult<()> {
        let same_parent = Arc::ptr_eq(self, new_parent);
        if same_parent && name == new_name {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let mut new_parent_state = if same_parent {
            None
        } else {
            Some(new_parent.state.lock().await)
        };
        let child = state
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| DinoError::NotFound(name.to_string()))?;
        let mut child_state = child.state.lock().await;
        child_state.name = new_name.to_string();
        match new_parent_state.as_mut() {
            Some(new_parent_state) => {
                new_parent_state
                    .children
                    .insert(new_name.to_string(), child.clone());
            }
            None => {
                state.children.insert(new_name.to_string(), child.clone());
            }
        }
        state.children.remove(name);

        child_state.should_save_metadata = true;
        state.should_save_metadata = true;
        child.sync(&mut child_state).await?;
        if let Some(new_parent_state) = new_parent_state.as_mut() {
            new_parent_state.should_save_metadata = true;
            new_parent.sync(new_parent_state).await?;
        }
        self.sync(&mut state).await?;
        Ok(())
    }
}
