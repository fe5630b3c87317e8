use std::sync::Arc;
use std::time::Duration;

use dino_lib::Message;
use rand::Rng;

use crate::{
    apply_message, BlobStore, DiskStore, InMemoryStore, Paired, SqliteStore, Store,
    VersionedStore, VersionedWrapper,
};

fn random_key() -> Vec<u8> {
    let mut key = vec![0u8; 20];
    rand::thread_rng().fill(&mut key[..]);
    key
}

fn random_version() -> u64 {
    rand::thread_rng().gen()
}

async fn check_store(store: Arc<dyn Store>) {
    // What you put is what you get.
    let key = random_key();
    store.put(&key, b"hello").await.unwrap();
    assert_eq!(b"hello".to_vec(), store.get(&key).await.unwrap());

    // Error on a key that does not exist.
    let missing = random_key();
    let err = store.get(&missing).await.unwrap_err();
    assert!(err.is_not_found(), "unwanted error: {}", err);

    // An empty value round-trips to an empty, non-absent value.
    let key = random_key();
    store.put(&key, &[]).await.unwrap();
    assert_eq!(Vec::<u8>::new(), store.get(&key).await.unwrap());

    // Mutating the caller-owned buffer after a put must not reach the
    // stored pair.
    let key = random_key();
    let mut value = b"old value".to_vec();
    store.put(&key, &value).await.unwrap();
    value[..3].copy_from_slice(b"new");
    assert_eq!(b"old value".to_vec(), store.get(&key).await.unwrap());

    // The corresponding versioned store honors the versioning contract.
    check_versioned_store(&VersionedWrapper::new(store)).await;
}

pub(crate) async fn check_versioned_store(vs: &dyn VersionedStore) {
    // Error on getting a key that does not exist.
    let missing = random_key();
    let err = vs.get(&missing).await.unwrap_err();
    assert!(err.is_not_found(), "unwanted error: {}", err);

    // Accepts any initial version for new pairs.
    let key = random_key();
    let version = (random_version() % 1_000_000).max(1);
    vs.put(version, &key, b"first").await.unwrap();
    let (got_version, got_value) = vs.get(&key).await.unwrap();
    assert_eq!(version, got_version);
    assert_eq!(b"first".to_vec(), got_value);

    // A put at or below the stored version is stale and leaves the stored
    // pair untouched.
    let err = vs.put(version, &key, b"loser").await.unwrap_err();
    assert!(err.is_stale_put(), "unwanted error: {}", err);
    if version > 1 {
        let err = vs.put(version - 1, &key, b"loser").await.unwrap_err();
        assert!(err.is_stale_put(), "unwanted error: {}", err);
    }
    let (got_version, got_value) = vs.get(&key).await.unwrap();
    assert_eq!(version, got_version);
    assert_eq!(b"first".to_vec(), got_value);

    // A strictly greater version goes through.
    vs.put(version + 1, &key, b"second").await.unwrap();
    let (got_version, got_value) = vs.get(&key).await.unwrap();
    assert_eq!(version + 1, got_version);
    assert_eq!(b"second".to_vec(), got_value);
}

#[tokio::test]
async fn test_in_memory_store() {
    check_store(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_disk_store() {
    let dir = tempfile::TempDir::new().unwrap();
    check_store(Arc::new(DiskStore::new(dir.path()))).await;
}

#[tokio::test]
async fn test_disk_store_folds_long_keys() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = DiskStore::new(dir.path());
    let key = vec![7u8; 200];
    store.put(&key, b"long-keyed").await.unwrap();
    assert_eq!(b"long-keyed".to_vec(), store.get(&key).await.unwrap());
}

#[tokio::test]
async fn test_sqlite_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("kv.db")).unwrap();
    check_store(Arc::new(store)).await;
}

#[tokio::test]
async fn test_paired_store() {
    let fast = Arc::new(InMemoryStore::new());
    let slow = Arc::new(InMemoryStore::new());
    check_store(Arc::new(Paired::new(fast, slow))).await;
}

#[tokio::test]
async fn test_paired_store_read_through_refill() {
    let fast = Arc::new(InMemoryStore::new());
    let slow = Arc::new(InMemoryStore::new());
    let paired = Paired::new(fast.clone(), slow.clone());

    let key = random_key();
    paired.put(&key, b"refill me").await.unwrap();

    // Wait for the write-back worker to land the pair in the slow store.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if slow.get(&key).await.is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "write-back never reached the slow store"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fast.clear();
    assert!(fast.get(&key).await.is_err());
    assert_eq!(b"refill me".to_vec(), paired.get(&key).await.unwrap());
    // The miss repopulated the fast store.
    assert_eq!(b"refill me".to_vec(), fast.get(&key).await.unwrap());
}

#[tokio::test]
async fn test_blob_store_idempotence() {
    let blobs = BlobStore::new(Arc::new(InMemoryStore::new()));
    let k1 = blobs.put(b"some bytes").await.unwrap();
    let k2 = blobs.put(b"some bytes").await.unwrap();
    assert_eq!(k1, k2);
    assert_eq!(20, k1.len());
    let k3 = blobs.put(b"other bytes").await.unwrap();
    assert_ne!(k1, k3);
    assert_eq!(b"some bytes".to_vec(), blobs.get(&k1).await.unwrap());
    assert_eq!(b"other bytes".to_vec(), blobs.get(&k3).await.unwrap());
}

#[tokio::test]
async fn test_apply_get_of_missing_key() {
    let store = VersionedWrapper::new(Arc::new(InMemoryStore::new()));
    let response = apply_message(
        &store,
        &Message::Get {
            tag: 7,
            key: b"nope".to_vec(),
        },
    )
    .await;
    match response {
        Message::Error { tag, text } => {
            assert_eq!(7, tag);
            assert!(text.ends_with("not found"), "unexpected text: {}", text);
        }
        other => panic!("unexpected response: {}", other),
    }
}

#[tokio::test]
async fn test_apply_put_echoes_and_get_returns() {
    let store = VersionedWrapper::new(Arc::new(InMemoryStore::new()));
    let put = Message::Put {
        tag: 1,
        key: b"genre".to_vec(),
        value: b"jazz".to_vec(),
        version: 1,
    };
    assert_eq!(put, apply_message(&store, &put).await);
    let response = apply_message(
        &store,
        &Message::Get {
            tag: 2,
            key: b"genre".to_vec(),
        },
    )
    .await;
    assert_eq!(
        Message::Put {
            tag: 2,
            key: b"genre".to_vec(),
            value: b"jazz".to_vec(),
            version: 1,
        },
        response
    );
}

#[tokio::test]
async fn test_apply_stale_put_reports_stale_text() {
    let store = VersionedWrapper::new(Arc::new(InMemoryStore::new()));
    let put = Message::Put {
        tag: 1,
        key: b"k".to_vec(),
        value: b"v1".to_vec(),
        version: 1,
    };
    apply_message(&store, &put).await;
    let response = apply_message(&store, &put).await;
    match response {
        Message::Error { text, .. } => assert_eq!("stale put", text),
        other => panic!("unexpected response: {}", other),
    }
}

#[tokio::test]
async fn test_apply_error_cannot_be_applied() {
    let store = VersionedWrapper::new(Arc::new(InMemoryStore::new()));
    let response = apply_message(
        &store,
        &Message::Error {
            tag: 431,
            text: "test error".to_string(),
        },
    )
    .await;
    assert_eq!(
        Message::Error {
            tag: 431,
            text: "error messages cannot be applied".to_string(),
        },
        response
    );
}
