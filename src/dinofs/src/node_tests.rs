use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult, Message};
use dino_metadata::{ChangeListener, Client, RemoteVersionedStore, Server};
use dino_store::{BlobStore, InMemoryStore, VersionedStore, VersionedWrapper};

use crate::factory::NodeFactory;
use crate::node::{
    Node, SetattrChanges, SetxattrFlags, MODE_NOT_LOADED, ROOT_KEY, S_IFDIR, S_IFLNK, S_IFREG,
};

/// A versioned store whose failures can be scripted: a persistent failure
/// toggle, or a per-call sequence consumed first. Successful calls hit a
/// real in-memory versioned store so loads and reloads behave.
struct FlakyVersionedStore {
    inner: VersionedWrapper,
    plan: std::sync::Mutex<FailurePlan>,
}

#[derive(Default)]
struct FailurePlan {
    fail: bool,
    sequence: Vec<bool>,
}

impl FlakyVersionedStore {
    fn new() -> Self {
        Self {
            inner: VersionedWrapper::new(Arc::new(InMemoryStore::new())),
            plan: std::sync::Mutex::new(FailurePlan::default()),
        }
    }

    fn ok(&self) {
        let mut plan = self.plan.lock().unwrap();
        plan.fail = false;
        plan.sequence.clear();
    }

    fn fail(&self) {
        let mut plan = self.plan.lock().unwrap();
        plan.fail = true;
        plan.sequence.clear();
    }

    fn fail_sequence(&self, sequence: &[bool]) {
        let mut plan = self.plan.lock().unwrap();
        plan.fail = false;
        plan.sequence = sequence.to_vec();
    }

    fn should_fail(&self) -> bool {
        let mut plan = self.plan.lock().unwrap();
        if !plan.sequence.is_empty() {
            return plan.sequence.remove(0);
        }
        plan.fail
    }
}

#[async_trait]
impl VersionedStore for FlakyVersionedStore {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> DinoResult<()> {
        if self.should_fail() {
            return Err(DinoError::StorageError(
                "computer bought the farm".to_string(),
            ));
        }
        self.inner.put(version, key, value).await
    }

    async fn get(&self, key: &[u8]) -> DinoResult<(u64, Vec<u8>)> {
        if self.should_fail() {
            return Err(DinoError::StorageError(
                "computer bought the farm".to_string(),
            ));
        }
        self.inner.get(key).await
    }
}

fn test_factory() -> (Arc<NodeFactory>, Arc<FlakyVersionedStore>) {
    let flaky = Arc::new(FlakyVersionedStore::new());
    let blobs = Arc::new(BlobStore::new(Arc::new(InMemoryStore::new())));
    let factory = NodeFactory::new(flaky.clone(), blobs);
    (factory, flaky)
}

async fn test_root(factory: &Arc<NodeFactory>) -> Arc<Node> {
    let root = factory.existing_node("root", ROOT_KEY);
    root.bootstrap_empty_dir().await;
    factory.adopt_root(&root);
    root
}

async fn file_node(factory: &Arc<NodeFactory>) -> Arc<Node> {
    let node = factory.alloc_node().unwrap();
    node.state.lock().await.mode = S_IFREG | 0o644;
    node
}

// ==================== Serialization ====================

#[tokio::test]
async fn test_node_serialization_round_trip() {
    let (factory, _flaky) = test_factory();
    let node = factory.alloc_node().unwrap();
    let child1 = factory.alloc_node().unwrap();
    let child2 = factory.alloc_node().unwrap();

    let mut state = node.state.lock().await;
    state.user = 1000;
    state.group = 100;
    state.mode = S_IFDIR | 0o750;
    state.time_ns = 1_234_567_890_123_456_789;
    state.content_key = (0..20).collect();
    state.xattrs.insert("user.color".to_string(), b"teal".to_vec());
    state
        .xattrs
        .insert("user.raw".to_string(), vec![0, 1, 2, 255]);
    state.children.insert("alpha".to_string(), child1.clone());
    state.children.insert("beta".to_string(), child2.clone());

    let raw = crate::metadata::serialize(&state);
    let record = crate::metadata::NodeRecord::unserialize(&raw).unwrap();
    assert_eq!(state.user, record.user);
    assert_eq!(state.group, record.group);
    assert_eq!(state.mode, record.mode);
    assert_eq!(state.time_ns, record.time_ns);
    assert_eq!(state.content_key, record.content_key);
    assert_eq!(state.xattrs, record.xattrs);
    assert_eq!(2, record.children.len());
    assert_eq!(child1.key(), record.children["alpha"]);
    assert_eq!(child2.key(), record.children["beta"]);
}

#[tokio::test]
async fn test_unserialize_of_short_input_fails() {
    assert!(crate::metadata::NodeRecord::unserialize(&[1, 2, 3]).is_err());
}

// ==================== Xattrs ====================

#[tokio::test]
async fn test_setxattr_rolls_back_additions() {
    let (factory, flaky) = test_factory();
    let node = file_node(&factory).await;
    flaky.fail();
    let err = node
        .setxattr("key", b"value", SetxattrFlags::Default)
        .await
        .unwrap_err();
    assert!(matches!(err, DinoError::StorageError(_)));
    let err = node.getxattr("key").await.unwrap_err();
    assert!(matches!(err, DinoError::NoData(_)));
}

#[tokio::test]
async fn test_setxattr_rolls_back_updates() {
    let (factory, flaky) = test_factory();
    let node = file_node(&factory).await;
    node.setxattr("key", b"old value", SetxattrFlags::Default)
        .await
        .unwrap();
    flaky.fail();
    node.setxattr("key", b"value", SetxattrFlags::Default)
        .await
        .unwrap_err();
    assert_eq!(b"old value".to_vec(), node.getxattr("key").await.unwrap());
}

#[tokio::test]
async fn test_setxattr_flags() {
    let (factory, _flaky) = test_factory();
    let node = file_node(&factory).await;
    node.setxattr("key", b"v1", SetxattrFlags::Create)
        .await
        .unwrap();
    let err = node
        .setxattr("key", b"v2", SetxattrFlags::Create)
        .await
        .unwrap_err();
    assert!(matches!(err, DinoError::AlreadyExists(_)));
    let err = node
        .setxattr("other", b"v", SetxattrFlags::Replace)
        .await
        .unwrap_err();
    assert!(matches!(err, DinoError::NoData(_)));
    node.setxattr("key", b"v2", SetxattrFlags::Replace)
        .await
        .unwrap();
    assert_eq!(b"v2".to_vec(), node.getxattr("key").await.unwrap());
    let mut names = node.listxattr().await;
    names.sort();
    assert_eq!(vec!["key".to_string()], names);
}

// ==================== Directory mutations ====================

#[tokio::test]
async fn test_rmdir_adds_back_removed_child() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    root.mkdir("d", 0o755).await.unwrap();

    flaky.fail();
    root.rmdir("d").await.unwrap_err();
    root.lookup("d").await.unwrap();

    flaky.ok();
    root.rmdir("d").await.unwrap();
    let err = root.lookup("d").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_rmdir_refuses_non_empty_directory() {
    let (factory, _flaky) = test_factory();
    let root = test_root(&factory).await;
    let d = root.mkdir("d", 0o755).await.unwrap();
    d.mkdir("inner", 0o755).await.unwrap();
    let err = root.rmdir("d").await.unwrap_err();
    assert!(matches!(err, DinoError::NotEmpty(_)));
}

#[tokio::test]
async fn test_unlink_adds_back_removed_child() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    let f = root.create("f", 0o644).await.unwrap();
    f.write(b"Peggy Sue", 0).await;
    f.flush().await.unwrap();

    flaky.fail();
    root.unlink("f").await.unwrap_err();

    // After the remove failure, the file is still there with its contents.
    flaky.ok();
    let again = root.lookup("f").await.unwrap();
    assert!(Arc::ptr_eq(&f, &again));
    assert_eq!(b"Peggy Sue".to_vec(), again.read(0, 100).await);

    root.unlink("f").await.unwrap();
    assert!(root.lookup("f").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_create_removes_child_when_child_sync_fails() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    flaky.fail();
    root.create("f", 0o644).await.unwrap_err();
    flaky.ok();
    assert!(root.lookup("f").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_create_removes_child_when_parent_sync_fails() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    flaky.fail_sequence(&[false, true]);
    root.create("f", 0o644).await.unwrap_err();
    flaky.ok();
    assert!(root.lookup("f").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_mkdir_removes_child_when_sync_fails() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    flaky.fail();
    root.mkdir("d", 0o755).await.unwrap_err();
    flaky.ok();
    assert!(root.lookup("d").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_symlink_removes_child_when_sync_fails() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    flaky.fail();
    root.symlink("target", "l").await.unwrap_err();
    flaky.ok();
    assert!(root.lookup("l").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_symlink_readlink() {
    let (factory, _flaky) = test_factory();
    let root = test_root(&factory).await;
    let l = root.symlink("the/target", "l").await.unwrap();
    assert_eq!(b"the/target".to_vec(), l.readlink().await.unwrap());
    let attr = l.getattr().await.unwrap();
    assert_eq!(S_IFLNK, attr.mode & libc::S_IFMT as u32);
}

// ==================== Content ====================

#[tokio::test]
async fn test_flush_reverts_to_old_contents() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    let f = root.create("f", 0o644).await.unwrap();
    f.write(b"old contents", 0).await;
    f.flush().await.unwrap();

    f.write(b"new contents", 0).await;
    flaky.fail();
    f.flush().await.unwrap_err();

    flaky.ok();
    f.open().await.unwrap();
    assert_eq!(b"old contents".to_vec(), f.read(0, 100).await);
}

#[tokio::test]
async fn test_write_and_read_arithmetic() {
    let (factory, _flaky) = test_factory();
    let f = file_node(&factory).await;
    assert_eq!(5, f.write(b"hello", 0).await);
    assert_eq!(b"hello".to_vec(), f.read(0, 5).await);
    assert_eq!(b"llo".to_vec(), f.read(2, 100).await);
    assert!(f.read(5, 10).await.is_empty());
    assert!(f.read(99, 10).await.is_empty());

    // A write past the end grows the content, zero-filling the hole.
    assert_eq!(1, f.write(b"x", 10).await);
    assert_eq!(b"hello\0\0\0\0\0x".to_vec(), f.read(0, 100).await);
}

#[tokio::test]
async fn test_setattr_rolls_back_every_field() {
    let (factory, flaky) = test_factory();
    let root = test_root(&factory).await;
    let f = root.create("f", 0o644).await.unwrap();
    f.write(b"twelve bytes", 0).await;
    f.flush().await.unwrap();
    let before = f.getattr().await.unwrap();

    flaky.fail();
    f.setattr(SetattrChanges {
        mode: Some(0o600),
        uid: Some(1234),
        gid: Some(5678),
        size: Some(4),
        mtime_ns: Some(42),
    })
    .await
    .unwrap_err();

    flaky.ok();
    let after = f.getattr().await.unwrap();
    assert_eq!(before.mode, after.mode);
    assert_eq!(before.user, after.user);
    assert_eq!(before.group, after.group);
    assert_eq!(before.size, after.size);
    assert_eq!(b"twelve bytes".to_vec(), f.read(0, 100).await);
}

#[tokio::test]
async fn test_setattr_truncates_and_chmods() {
    let (factory, _flaky) = test_factory();
    let root = test_root(&factory).await;
    let f = root.create("f", 0o644).await.unwrap();
    f.write(b"twelve bytes", 0).await;
    f.flush().await.unwrap();
    f.setattr(SetattrChanges {
        mode: Some(0o600),
        size: Some(6),
        ..Default::default()
    })
    .await
    .unwrap();
    let attr = f.getattr().await.unwrap();
    assert_eq!(6, attr.size);
    assert_eq!(0o600, attr.mode & 0o7777);
    assert_eq!(S_IFREG, attr.mode & libc::S_IFMT as u32);
    assert_eq!(b"twelve".to_vec(), f.read(0, 100).await);
}

// ==================== Rename ====================

#[tokio::test]
async fn test_rename_across_directories() {
    let (factory, _flaky) = test_factory();
    let root = test_root(&factory).await;
    let d1 = root.mkdir("d1", 0o755).await.unwrap();
    let d2 = root.mkdir("d2", 0o755).await.unwrap();
    let f = d1.create("f", 0o644).await.unwrap();
    f.write(b"payload", 0).await;
    f.flush().await.unwrap();

    d1.rename("f", &d2, "g").await.unwrap();
    assert!(d1.lookup("f").await.unwrap_err().is_not_found());
    let moved = d2.lookup("g").await.unwrap();
    assert!(Arc::ptr_eq(&f, &moved));
    assert_eq!(b"payload".to_vec(), moved.read(0, 100).await);
}

#[tokio::test]
async fn test_rename_within_a_directory() {
    let (factory, _flaky) = test_factory();
    let root = test_root(&factory).await;
    let f = root.create("old", 0o644).await.unwrap();
    root.rename("old", &root, "new").await.unwrap();
    assert!(root.lookup("old").await.unwrap_err().is_not_found());
    let moved = root.lookup("new").await.unwrap();
    assert!(Arc::ptr_eq(&f, &moved));
}

// ==================== Change notifications ====================

#[tokio::test]
async fn test_stale_notifications_are_discarded() {
    let (factory, _flaky) = test_factory();
    let node = file_node(&factory).await;
    node.state.lock().await.version = 5;

    let mutation = |version| Message::Put {
        tag: 0,
        key: node.key().to_vec(),
        value: Vec::new(),
        version,
    };
    factory.invalidate_cache(mutation(5)).await;
    assert!(!node.state.lock().await.should_reload_metadata);
    factory.invalidate_cache(mutation(6)).await;
    assert!(node.state.lock().await.should_reload_metadata);
}

#[tokio::test]
async fn test_notifications_for_unknown_keys_are_ignored() {
    let (factory, _flaky) = test_factory();
    factory
        .invalidate_cache(Message::Put {
            tag: 0,
            key: vec![9; 20],
            value: Vec::new(),
            version: 1,
        })
        .await;
    factory
        .invalidate_cache(Message::Put {
            tag: 0,
            key: b"short".to_vec(),
            value: Vec::new(),
            version: 1,
        })
        .await;
}

// ==================== Two clients through a broker ====================

fn attach_engine(address: &str) -> (Arc<NodeFactory>, Arc<RemoteVersionedStore>) {
    let slot: Arc<OnceLock<Arc<NodeFactory>>> = Arc::new(OnceLock::new());
    let listener: ChangeListener = {
        let slot = slot.clone();
        Arc::new(move |mutation: Message| {
            let slot = slot.clone();
            Box::pin(async move {
                if let Some(factory) = slot.get() {
                    factory.invalidate_cache(mutation).await;
                }
            })
        })
    };
    let client = Arc::new(Client::with_timeout(address, Duration::from_secs(5)));
    let remote = Arc::new(
        RemoteVersionedStore::new(client)
            .with_request_timeout(Duration::from_secs(5))
            .with_change_listener(listener),
    );
    remote.start();
    // Both engines address the same blob universe in a real deployment;
    // keyed by digest, separate in-memory backends only matter for content,
    // which this test writes through each client's own store.
    let blobs = Arc::new(BlobStore::new(Arc::new(InMemoryStore::new())));
    let factory = NodeFactory::new(remote.clone(), blobs);
    let _ = slot.set(factory.clone());
    (factory, remote)
}

#[tokio::test]
async fn test_reload_reconciles_a_remotely_added_child() {
    let store = Arc::new(VersionedWrapper::new(Arc::new(InMemoryStore::new())));
    let server = Server::new(store);
    let address = server.listen("127.0.0.1:0").await.unwrap().to_string();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve().await.unwrap();
        })
    };

    // Client 1 builds /a/b.
    let (factory1, remote1) = attach_engine(&address);
    let root1 = factory1.existing_node("root", ROOT_KEY);
    root1.bootstrap_empty_dir().await;
    factory1.adopt_root(&root1);
    let a1 = root1.mkdir("a", 0o755).await.unwrap();
    a1.mkdir("b", 0o755).await.unwrap();

    // Client 2 opens /a, populating its known-set.
    let (factory2, remote2) = attach_engine(&address);
    let root2 = factory2.existing_node("root", ROOT_KEY);
    root2.load(ROOT_KEY).await.unwrap();
    factory2.adopt_root(&root2);
    let a2 = root2.lookup("a").await.unwrap();
    assert_ne!(MODE_NOT_LOADED, a2.getattr().await.unwrap().mode);
    let b2 = a2.lookup("b").await.unwrap();

    // Client 1 writes a new child /a/c; the broadcast must mark client 2's
    // node for reload.
    a1.mkdir("c", 0o755).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if a2.state.lock().await.should_reload_metadata {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "change notification never marked the node"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The next lookup reconciles: b unchanged, c added as a sentinel
    // resolvable on demand.
    let c2 = a2.lookup("c").await.unwrap();
    let attr = c2.getattr().await.unwrap();
    assert_eq!(S_IFDIR, attr.mode & libc::S_IFMT as u32);
    let b2_again = a2.lookup("b").await.unwrap();
    assert!(Arc::ptr_eq(&b2, &b2_again));

    remote1.stop().await;
    remote2.stop().await;
    server.shutdown().await;
    serving.await.unwrap();
}
