//! SQLite storage backend
//!
//! Envelopes live in `{prefix}_messages`, ordering locks in
//! `{prefix}_locks`. A claim runs inside `BEGIN IMMEDIATE` so that
//! selecting the head envelope, taking its ordering lock and deleting
//! the row happen atomically with respect to every other worker sharing
//! the database file.

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{Session, Subscription, Wakeups};
use crate::clock::{Clock, add_delay, from_millis, to_millis};
use crate::config::{DatabaseConfig, is_sql_identifier};
use crate::envelope::{Envelope, WorkerId};
use crate::error::{QueueError, Result};
use crate::metrics::record_backend_error;
use crate::ordering::{Claim, OrderingLease};

/// SQL text, rendered once for the configured table prefix
struct Statements {
    schema: Vec<String>,
    insert: String,
    select_claimable: String,
    delete_claimed: String,
    try_lock: String,
    unlock: String,
    count_pending: String,
    count_locks: String,
    drop: Vec<String>,
}

impl Statements {
    fn new(prefix: &str) -> Self {
        let messages = format!("{prefix}_messages");
        let locks = format!("{prefix}_locks");

        Self {
            schema: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {messages} (
                        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                        id TEXT NOT NULL UNIQUE,
                        payload TEXT NOT NULL,
                        ordering_key TEXT,
                        visible_at INTEGER NOT NULL,
                        attempt INTEGER NOT NULL DEFAULT 0,
                        created_at INTEGER NOT NULL
                    )"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {messages}_visible_idx
                        ON {messages} (visible_at, sequence)"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {messages}_ordering_idx
                        ON {messages} (ordering_key, sequence)"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {locks} (
                        ordering_key TEXT PRIMARY KEY,
                        owner TEXT NOT NULL,
                        expires_at INTEGER NOT NULL
                    )"
                ),
            ],
            insert: format!(
                "INSERT INTO {messages}
                    (id, payload, ordering_key, visible_at, attempt, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)"
            ),
            // Keyed envelopes are only eligible at the head of their group
            // and only while no unexpired lock exists for the key.
            select_claimable: format!(
                "SELECT m.sequence AS sequence, m.id AS id, m.payload AS payload,
                        m.ordering_key AS ordering_key, m.visible_at AS visible_at,
                        m.attempt AS attempt
                 FROM {messages} AS m
                 WHERE m.visible_at <= ?
                   AND (m.ordering_key IS NULL OR (
                        NOT EXISTS (
                            SELECT 1 FROM {locks} AS l
                            WHERE l.ordering_key = m.ordering_key AND l.expires_at > ?
                        )
                        AND NOT EXISTS (
                            SELECT 1 FROM {messages} AS p
                            WHERE p.ordering_key = m.ordering_key AND p.sequence < m.sequence
                        )
                   ))
                 ORDER BY m.visible_at ASC, m.sequence ASC
                 LIMIT 1"
            ),
            delete_claimed: format!("DELETE FROM {messages} WHERE sequence = ?"),
            try_lock: format!(
                "INSERT INTO {locks} (ordering_key, owner, expires_at) VALUES (?, ?, ?)
                 ON CONFLICT (ordering_key) DO UPDATE
                    SET owner = excluded.owner, expires_at = excluded.expires_at
                    WHERE {locks}.expires_at <= ?"
            ),
            unlock: format!("DELETE FROM {locks} WHERE ordering_key = ? AND owner = ?"),
            count_pending: format!("SELECT COUNT(*) FROM {messages}"),
            count_locks: format!("SELECT COUNT(*) FROM {locks} WHERE expires_at > ?"),
            drop: vec![
                format!("DROP TABLE IF EXISTS {messages}"),
                format!("DROP TABLE IF EXISTS {locks}"),
            ],
        }
    }
}

/// SQLite-backed queue storage
pub struct SqliteBackend {
    pool: SqlitePool,
    statements: Statements,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    initialized: OnceCell<()>,
    wakeups: Wakeups,
}

impl SqliteBackend {
    /// Open (or create) the database file and build a pool
    ///
    /// # Errors
    /// Returns error if the file cannot be created or opened
    pub async fn connect(
        config: &DatabaseConfig,
        clock: Arc<dyn Clock>,
        lease_duration: Duration,
    ) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| QueueError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        tracing::info!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "SQLite queue backend connected"
        );

        Self::from_pool(pool, &config.table_prefix, clock, lease_duration)
    }

    /// Wrap an existing pool
    ///
    /// # Errors
    /// Returns error if `table_prefix` is not a plain SQL identifier
    pub fn from_pool(
        pool: SqlitePool,
        table_prefix: &str,
        clock: Arc<dyn Clock>,
        lease_duration: Duration,
    ) -> Result<Self> {
        if !is_sql_identifier(table_prefix) {
            return Err(QueueError::Validation(format!(
                "table prefix must be an SQL identifier, got {table_prefix:?}"
            )));
        }

        Ok(Self {
            pool,
            statements: Statements::new(table_prefix),
            clock,
            lease_duration,
            initialized: OnceCell::new(),
            wakeups: Wakeups::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create tables and indexes once per instance
    ///
    /// Concurrent callers share one attempt. A failed attempt is not
    /// memoized, so the next caller tries again.
    pub async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| self.create_schema())
            .await
            .map(|_| ())
    }

    async fn create_schema(&self) -> Result<()> {
        for statement in &self.statements.schema {
            match sqlx::query(statement).execute(&self.pool).await {
                Ok(_) => {}
                Err(error) if is_duplicate_object_error(&error) => {
                    tracing::debug!(%error, "Schema object created concurrently");
                }
                Err(error) => {
                    tracing::error!(%error, "Queue schema setup failed");
                    return Err(QueueError::Initialization(error.to_string()));
                }
            }
        }

        tracing::info!("Queue schema ready");
        Ok(())
    }

    fn insert_query<'q>(
        &'q self,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>> {
        let payload = serde_json::to_string(&envelope.payload)?;

        Ok(sqlx::query(&self.statements.insert)
            .bind(envelope.id.to_string())
            .bind(payload)
            .bind(envelope.ordering_key.clone())
            .bind(to_millis(envelope.visible_at))
            .bind(i64::from(envelope.attempt))
            .bind(to_millis(now)))
    }

    pub async fn insert(&self, envelope: &Envelope) -> Result<()> {
        let now = self.clock.now();
        self.insert_query(envelope, now)?.execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a batch atomically: all rows or none
    pub async fn insert_many(&self, envelopes: &[Envelope]) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        for envelope in envelopes {
            self.insert_query(envelope, now)?.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Claim the earliest eligible envelope
    ///
    /// For keyed envelopes the returned lease owns the connection that
    /// took the lock until it is released.
    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Claim>> {
        let mut connection = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *connection)
            .await?;

        let now = self.clock.now();
        let claimed = match self.claim_in_transaction(&mut connection, worker, now).await {
            Ok(claimed) => claimed,
            Err(error) => {
                rollback(connection).await;
                return Err(error);
            }
        };

        if let Err(error) = sqlx::query("COMMIT").execute(&mut *connection).await {
            rollback(connection).await;
            return Err(error.into());
        }

        let Some(envelope) = claimed else {
            return Ok(None);
        };

        let lease = envelope.ordering_key.clone().map(|key| {
            OrderingLease::new(
                key,
                worker.clone(),
                self.lease_deadline(now),
                Session::Sqlite(connection),
            )
        });

        Ok(Some(Claim::new(envelope, lease)))
    }

    async fn claim_in_transaction(
        &self,
        connection: &mut SqliteConnection,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Envelope>> {
        let now_millis = to_millis(now);
        let envelope = loop {
            let row = sqlx::query(&self.statements.select_claimable)
                .bind(now_millis)
                .bind(now_millis)
                .fetch_optional(&mut *connection)
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            match envelope_from_row(&row) {
                Ok(envelope) => break envelope,
                Err(error) => {
                    // Left in place, an undecodable row would head the
                    // queue (and its key group) forever.
                    let sequence: i64 = row.try_get("sequence")?;
                    record_backend_error("decode");
                    tracing::error!(sequence, %error, "Discarding undecodable envelope");
                    sqlx::query(&self.statements.delete_claimed)
                        .bind(sequence)
                        .execute(&mut *connection)
                        .await?;
                }
            }
        };

        if let Some(key) = &envelope.ordering_key {
            if !self.try_lock(&mut *connection, key, worker, now).await? {
                tracing::debug!(ordering_key = %key, "Ordering lock taken concurrently");
                return Ok(None);
            }
        }

        sqlx::query(&self.statements.delete_claimed)
            .bind(envelope.sequence)
            .execute(&mut *connection)
            .await?;

        Ok(Some(envelope))
    }

    /// Single upsert: inserts a fresh lock or takes over an expired one
    async fn try_lock(
        &self,
        connection: &mut SqliteConnection,
        key: &str,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(&self.statements.try_lock)
            .bind(key)
            .bind(worker.as_str())
            .bind(to_millis(self.lease_deadline(now)))
            .bind(to_millis(now))
            .execute(&mut *connection)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add_delay(now, self.lease_duration).unwrap_or(now)
    }

    pub async fn acquire_ordering_lock(
        &self,
        key: &str,
        worker: &WorkerId,
    ) -> Result<Option<OrderingLease>> {
        let mut connection = self.pool.acquire().await?;
        let now = self.clock.now();

        if !self.try_lock(&mut connection, key, worker, now).await? {
            return Ok(None);
        }

        Ok(Some(OrderingLease::new(
            key.to_string(),
            worker.clone(),
            self.lease_deadline(now),
            Session::Sqlite(connection),
        )))
    }

    /// Delete the lock row on the connection that created it
    pub(crate) async fn release_lock(
        &self,
        mut connection: PoolConnection<Sqlite>,
        key: &str,
        owner: &WorkerId,
    ) -> Result<()> {
        let result = sqlx::query(&self.statements.unlock)
            .bind(key)
            .bind(owner.as_str())
            .execute(&mut *connection)
            .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                ordering_key = %key,
                owner = %owner,
                "Ordering lock was no longer held at release"
            );
        }

        Ok(())
    }

    pub fn notify(&self) {
        self.wakeups.notify();
    }

    pub fn subscribe(&self) -> Subscription {
        self.wakeups.subscribe()
    }

    /// Drop queue-owned tables
    ///
    /// Terminal: the instance does not recreate them afterwards.
    pub async fn drop_all(&self) -> Result<()> {
        for statement in &self.statements.drop {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Queue tables dropped");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&self.statements.count_pending)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn active_lock_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&self.statements.count_locks)
            .bind(to_millis(self.clock.now()))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

async fn rollback(mut connection: PoolConnection<Sqlite>) {
    if let Err(error) = sqlx::query("ROLLBACK").execute(&mut *connection).await {
        tracing::warn!(%error, "Rollback failed; discarding connection");
        drop(connection.detach());
    }
}

fn envelope_from_row(row: &SqliteRow) -> Result<Envelope> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let attempt: i64 = row.try_get("attempt")?;

    Ok(Envelope {
        id: id.parse()?,
        payload: serde_json::from_str(&payload)?,
        ordering_key: row.try_get("ordering_key")?,
        visible_at: from_millis(row.try_get::<i64, _>("visible_at")?),
        sequence: Some(row.try_get::<i64, _>("sequence")?),
        attempt: u32::try_from(attempt).unwrap_or(0),
    })
}

/// "Already exists" failures are expected when workers race on schema setup
pub(crate) fn is_duplicate_object_error(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.message().contains("already exists"))
}
