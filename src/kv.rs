//! Key-value store
//!
//! Small TTL-aware store living next to the queue. The federation outbox
//! uses it to remember which (activity, inbox) pairs were already
//! delivered, so at-least-once redelivery does not turn into duplicate
//! POSTs.
//!
//! Keys are lists of string segments. They are stored as their JSON
//! encoding, which keeps prefix listing a plain string comparison.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

use crate::backend::is_duplicate_object_error;
use crate::clock::{Clock, add_delay, to_millis};
use crate::config::is_sql_identifier;
use crate::error::{QueueError, Result};

/// Hierarchical key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KvKey(Vec<String>);

impl KvKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &KvKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    fn decode(encoded: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(encoded)?))
    }

    /// `["a","b"]` becomes `["a","b",`; `[]` becomes `[`
    fn encode_prefix(&self) -> Result<String> {
        let encoded = self.encode()?;
        let open = encoded.strip_suffix(']').unwrap_or(&encoded);
        if self.0.is_empty() {
            Ok(open.to_string())
        } else {
            Ok(format!("{open},"))
        }
    }
}

impl<const N: usize> From<[&str; N]> for KvKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

/// Key-value store backed by SQLite or memory
pub enum KvStore {
    Sqlite(SqliteKvStore),
    Memory(MemoryKvStore),
}

impl KvStore {
    /// SQLite store sharing an existing pool
    pub fn sqlite(pool: SqlitePool, table_prefix: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(KvStore::Sqlite(SqliteKvStore::new(pool, table_prefix, clock)?))
    }

    pub fn memory(clock: Arc<dyn Clock>) -> Self {
        KvStore::Memory(MemoryKvStore::new(clock))
    }

    pub async fn get(&self, key: &KvKey) -> Result<Option<Value>> {
        match self {
            KvStore::Sqlite(store) => store.get(key).await,
            KvStore::Memory(store) => Ok(store.get(key).await),
        }
    }

    /// Store `value`, optionally expiring after `ttl`
    pub async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<()> {
        match self {
            KvStore::Sqlite(store) => store.set(key, value, ttl).await,
            KvStore::Memory(store) => {
                store.set(key, value, ttl).await;
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &KvKey) -> Result<()> {
        match self {
            KvStore::Sqlite(store) => store.delete(key).await,
            KvStore::Memory(store) => {
                store.delete(key).await;
                Ok(())
            }
        }
    }

    /// Live entries whose key equals or extends `prefix`, sorted by key
    pub async fn list(&self, prefix: &KvKey) -> Result<Vec<(KvKey, Value)>> {
        match self {
            KvStore::Sqlite(store) => store.list(prefix).await,
            KvStore::Memory(store) => Ok(store.list(prefix).await),
        }
    }

    /// Replace the value only if the current one equals `expected`
    ///
    /// `expected = None` means "only if absent". Returns whether the swap
    /// happened.
    pub async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        match self {
            KvStore::Sqlite(store) => store.cas(key, expected, new, ttl).await,
            KvStore::Memory(store) => Ok(store.cas(key, expected, new, ttl).await),
        }
    }
}

struct KvStatements {
    schema: String,
    get: String,
    set: String,
    delete: String,
    list: String,
}

/// SQLite-backed store in `{prefix}_kv`
pub struct SqliteKvStore {
    pool: SqlitePool,
    statements: KvStatements,
    clock: Arc<dyn Clock>,
    initialized: OnceCell<()>,
}

impl SqliteKvStore {
    pub fn new(pool: SqlitePool, table_prefix: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if !is_sql_identifier(table_prefix) {
            return Err(QueueError::Validation(format!(
                "table prefix must be an SQL identifier, got {table_prefix:?}"
            )));
        }

        let table = format!("{table_prefix}_kv");
        let live = "(expires_at IS NULL OR expires_at > ?)";
        Ok(Self {
            pool,
            statements: KvStatements {
                schema: format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        key TEXT PRIMARY KEY,
                        value TEXT NOT NULL,
                        expires_at INTEGER
                    )"
                ),
                get: format!("SELECT value FROM {table} WHERE key = ? AND {live}"),
                set: format!(
                    "INSERT INTO {table} (key, value, expires_at) VALUES (?, ?, ?)
                     ON CONFLICT (key) DO UPDATE
                        SET value = excluded.value, expires_at = excluded.expires_at"
                ),
                delete: format!("DELETE FROM {table} WHERE key = ?"),
                list: format!(
                    "SELECT key, value FROM {table}
                     WHERE (key = ? OR substr(key, 1, ?) = ?) AND {live}"
                ),
            },
            clock,
            initialized: OnceCell::new(),
        })
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                match sqlx::query(&self.statements.schema)
                    .execute(&self.pool)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(error) if is_duplicate_object_error(&error) => Ok(()),
                    Err(error) => Err(QueueError::Initialization(error.to_string())),
                }
            })
            .await
            .map(|_| ())
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        let now = self.clock.now();
        ttl.map(|ttl| to_millis(add_delay(now, ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)))
    }

    async fn get(&self, key: &KvKey) -> Result<Option<Value>> {
        self.initialize().await?;
        let value: Option<String> = sqlx::query_scalar(&self.statements.get)
            .bind(key.encode()?)
            .bind(to_millis(self.clock.now()))
            .fetch_optional(&self.pool)
            .await?;

        value
            .map(|value| serde_json::from_str(&value).map_err(QueueError::from))
            .transpose()
    }

    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.initialize().await?;
        sqlx::query(&self.statements.set)
            .bind(key.encode()?)
            .bind(serde_json::to_string(&value)?)
            .bind(self.expiry(ttl))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<()> {
        self.initialize().await?;
        sqlx::query(&self.statements.delete)
            .bind(key.encode()?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &KvKey) -> Result<Vec<(KvKey, Value)>> {
        self.initialize().await?;
        let open = prefix.encode_prefix()?;
        let rows = sqlx::query(&self.statements.list)
            .bind(prefix.encode()?)
            .bind(open.chars().count() as i64)
            .bind(&open)
            .bind(to_millis(self.clock.now()))
            .fetch_all(&self.pool)
            .await?;

        let mut entries = rows
            .iter()
            .map(|row| -> Result<(KvKey, Value)> {
                let key: String = row.try_get("key")?;
                let value: String = row.try_get("value")?;
                Ok((KvKey::decode(&key)?, serde_json::from_str(&value)?))
            })
            .collect::<Result<Vec<_>>>()?;

        // JSON text order puts `,` before `]`; sort by segments instead.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.initialize().await?;
        let encoded = key.encode()?;
        let mut connection = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *connection)
            .await?;

        let outcome: Result<bool> = async {
            let current: Option<String> = sqlx::query_scalar(&self.statements.get)
                .bind(&encoded)
                .bind(to_millis(self.clock.now()))
                .fetch_optional(&mut *connection)
                .await?;
            let current = current
                .map(|value| serde_json::from_str::<Value>(&value))
                .transpose()?;

            if current.as_ref() != expected {
                return Ok(false);
            }

            sqlx::query(&self.statements.set)
                .bind(&encoded)
                .bind(serde_json::to_string(&new)?)
                .bind(self.expiry(ttl))
                .execute(&mut *connection)
                .await?;
            Ok(true)
        }
        .await;

        let finish = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Err(error) = sqlx::query(finish).execute(&mut *connection).await {
            drop(connection.detach());
            return Err(error.into());
        }
        outcome
    }
}

struct MemoryEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Single-process store
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<KvKey, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn is_live(entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        entry.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        ttl.map(|ttl| add_delay(now, ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    async fn get(&self, key: &KvKey) -> Option<Value> {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .get(key)
            .filter(|entry| Self::is_live(entry, now))
            .map(|entry| entry.value.clone())
    }

    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) {
        let expires_at = self.expiry(ttl);
        self.entries
            .lock()
            .await
            .insert(key.clone(), MemoryEntry { value, expires_at });
    }

    async fn delete(&self, key: &KvKey) {
        self.entries.lock().await.remove(key);
    }

    async fn list(&self, prefix: &KvKey) -> Vec<(KvKey, Value)> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| Self::is_live(entry, now));
        entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> bool {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;

        let current = entries
            .get(key)
            .filter(|entry| Self::is_live(entry, now))
            .map(|entry| &entry.value);
        if current != expected {
            return false;
        }

        entries.insert(
            key.clone(),
            MemoryEntry {
                value: new,
                expires_at,
            },
        );
        true
    }
}
