use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};
use rusqlite::{params, Connection, OptionalExtension};

use crate::Store;

/// A `Store` whose backend is an embedded sqlite database, used by the
/// metadata server for its authoritative state.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> DinoResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| DinoError::DbError(format!("open {}: {}", path.display(), e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> DinoResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DinoError::DbError(format!("open in-memory db: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> DinoResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )
        .map_err(|e| DinoError::DbError(format!("could not ensure kv table exists: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DinoError::DbError("sqlite store lock poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| DinoError::DbError(format!("put {}: {}", crate::short_key(key), e)))?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DinoError::DbError("sqlite store lock poisoned".to_string()))?;
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| DinoError::DbError(format!("get {}: {}", crate::short_key(key), e)))?
        .ok_or_else(|| DinoError::NotFound(hex::encode(key)))
    }
}
