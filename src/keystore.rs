//! Key store adapter (C2): a column/key/value store with per-tag
//! serializable transactions, the storage seam every other component in
//! this crate (LID mapping, Signal sessions, device lists) is built on.
//!
//! Grounded on the teacher's `store::DeviceStore` trait/`MemoryStore` pair
//! in `store/mod.rs`, generalized from a fixed device schema to an
//! arbitrary column namespace, and on `database/mod.rs`'s `Transaction`
//! wrapper for the `sqlx`-backed implementation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A single write: `(column, key, value)`. `value: None` deletes the key.
pub type Write = (String, String, Option<Vec<u8>>);

/// The raw storage backend a [`KeyStore`] wraps. Implementations need not
/// worry about transaction semantics; [`KeyStore`] serializes same-tag
/// transactions and buffers their writes for one atomic [`KeyStoreBackend::commit`].
#[async_trait]
pub trait KeyStoreBackend: Send + Sync {
    async fn get_raw(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>>;

    async fn commit(&self, writes: Vec<Write>) -> Result<()>;
}

/// Handle passed into a transaction body: reads see the backend plus this
/// transaction's own buffered-but-uncommitted writes; writes are buffered
/// and only reach the backend if the body returns `Ok`.
pub struct Txn<'a> {
    store: &'a KeyStore,
    buffer: Mutex<Vec<Write>>,
}

impl<'a> Txn<'a> {
    pub async fn get(&self, column: &str, keys: &[String]) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let mut result = self.store.get(column, keys).await?;
        let buffer = self.buffer.lock().await;
        for (c, k, v) in buffer.iter() {
            if c == column && keys.iter().any(|key| key == k) {
                result.insert(k.clone(), v.clone());
            }
        }
        Ok(result)
    }

    pub async fn set(&self, column: &str, values: HashMap<String, Option<Vec<u8>>>) {
        let mut buffer = self.buffer.lock().await;
        for (key, value) in values {
            buffer.push((column.to_string(), key, value));
        }
    }
}

/// The key store adapter component (C2). Serializes transactions that share
/// a tag so a caller can run multiple related mutations (e.g. a PN/LID
/// mapping write plus the session migration it triggers) as one atomic,
/// ordered unit without blocking unrelated tags.
pub struct KeyStore {
    backend: Box<dyn KeyStoreBackend>,
    tag_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl KeyStore {
    pub fn new(backend: Box<dyn KeyStoreBackend>) -> Self {
        Self { backend, tag_locks: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, column: &str, keys: &[String]) -> Result<HashMap<String, Option<Vec<u8>>>> {
        self.backend.get_raw(column, keys).await
    }

    pub async fn set(&self, column: &str, values: HashMap<String, Option<Vec<u8>>>) -> Result<()> {
        let writes = values.into_iter().map(|(k, v)| (column.to_string(), k, v)).collect();
        self.backend.commit(writes).await
    }

    async fn tag_lock(&self, tag: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.tag_locks.lock().await;
        locks.entry(tag.to_string()).or_insert_with(|| std::sync::Arc::new(Mutex::new(()))).clone()
    }

    /// Run `f` with exclusive access among transactions sharing `tag`. Writes
    /// made through the `Txn` handle are buffered and committed atomically
    /// only if `f` resolves `Ok`.
    pub async fn transaction<F, T>(&self, tag: &str, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t Txn<'t>) -> BoxFuture<'t, Result<T>>,
    {
        let lock = self.tag_lock(tag).await;
        let _guard = lock.lock().await;

        let txn = Txn { store: self, buffer: Mutex::new(Vec::new()) };
        let result = f(&txn).await;
        let writes = txn.buffer.into_inner();

        match result {
            Ok(value) => {
                self.backend.commit(writes).await?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory backend, for tests and for running the crate without
/// persistent storage.
#[derive(Default)]
pub struct MemoryKeyStoreBackend {
    rows: tokio::sync::RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKeyStoreBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStoreBackend for MemoryKeyStoreBackend {
    async fn get_raw(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let rows = self.rows.read().await;
        Ok(keys
            .iter()
            .map(|k| (k.clone(), rows.get(&(column.to_string(), k.clone())).cloned()))
            .collect())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut rows = self.rows.write().await;
        for (column, key, value) in writes {
            match value {
                Some(bytes) => {
                    rows.insert((column, key), bytes);
                }
                None => {
                    rows.remove(&(column, key));
                }
            }
        }
        Ok(())
    }
}

/// `sqlx`-backed durable implementation, following the teacher's
/// `database::Database` pool-and-pragma setup.
pub struct SqliteKeyStoreBackend {
    pool: sqlx::SqlitePool,
}

impl SqliteKeyStoreBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = sqlx::SqlitePool::connect(url)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                column TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (column, key)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyStoreBackend for SqliteKeyStoreBackend {
    async fn get_raw(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let mut result = HashMap::new();
        for key in keys {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT value FROM kv WHERE column = ? AND key = ?")
                    .bind(column)
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| Error::Store(e.to_string()))?;
            result.insert(key.clone(), row.map(|(v,)| v));
        }
        Ok(result)
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Store(e.to_string()))?;
        for (column, key, value) in writes {
            match value {
                Some(bytes) => {
                    sqlx::query(
                        "INSERT INTO kv (column, key, value) VALUES (?, ?, ?)
                         ON CONFLICT(column, key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(&column)
                    .bind(&key)
                    .bind(bytes)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::Store(e.to_string()))?;
                }
                None => {
                    sqlx::query("DELETE FROM kv WHERE column = ? AND key = ?")
                        .bind(&column)
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::Store(e.to_string()))?;
                }
            }
        }
        tx.commit().await.map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(pairs: &[(&str, &str)]) -> HashMap<String, Option<Vec<u8>>> {
        pairs.iter().map(|(k, v)| (k.to_string(), Some(v.as_bytes().to_vec()))).collect()
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = KeyStore::new(Box::new(MemoryKeyStoreBackend::new()));
        store.set("session", vals(&[("a", "1")])).await.unwrap();
        let got = store.get("session", &["a".to_string()]).await.unwrap();
        assert_eq!(got.get("a").unwrap().as_deref(), Some(b"1".as_slice()));
    }

    #[tokio::test]
    async fn none_value_deletes() {
        let store = KeyStore::new(Box::new(MemoryKeyStoreBackend::new()));
        store.set("session", vals(&[("a", "1")])).await.unwrap();
        let mut del = HashMap::new();
        del.insert("a".to_string(), None);
        store.set("session", del).await.unwrap();
        let got = store.get("session", &["a".to_string()]).await.unwrap();
        assert_eq!(got.get("a").unwrap(), &None);
    }

    #[tokio::test]
    async fn transaction_commits_only_on_success() {
        let store = KeyStore::new(Box::new(MemoryKeyStoreBackend::new()));

        let err: Result<()> = store
            .transaction("pn:1", |txn| {
                Box::pin(async move {
                    txn.set("session", vals(&[("a", "1")])).await;
                    Err(Error::Protocol("abort".to_string()))
                })
            })
            .await;
        assert!(err.is_err());
        let got = store.get("session", &["a".to_string()]).await.unwrap();
        assert_eq!(got.get("a").unwrap(), &None);

        store
            .transaction("pn:1", |txn| {
                Box::pin(async move {
                    txn.set("session", vals(&[("a", "1")])).await;
                    Ok(())
                })
            })
            .await
            .unwrap();
        let got = store.get("session", &["a".to_string()]).await.unwrap();
        assert_eq!(got.get("a").unwrap().as_deref(), Some(b"1".as_slice()));
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let store = KeyStore::new(Box::new(MemoryKeyStoreBackend::new()));
        let seen = store
            .transaction("pn:1", |txn| {
                Box::pin(async move {
                    txn.set("session", vals(&[("a", "1")])).await;
                    let read = txn.get("session", &["a".to_string()]).await?;
                    Ok(read.get("a").cloned().flatten())
                })
            })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some(b"1".as_slice()));
    }
}
