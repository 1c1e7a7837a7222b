use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};

use crate::error::StoreError;
use crate::store::{child_key, Change, RealtimeStore, CHANGE_CAPACITY};

/// SQLite-backed realtime store. One row per written path; change
/// notifications are published in-process after each committed write.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    tx: broadcast::Sender<Change>,
    /// Held across each upsert and its broadcast.
    write_lock: Arc<Mutex<()>>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/aquafeed/aquafeed.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        let (tx, _rx) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self {
            pool,
            tx,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

fn backend(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Backend(format!("{op} failed: {e}"))
}

fn decode(path: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Corrupt {
        path: path.to_string(),
        source,
    })
}

#[async_trait]
impl RealtimeStore for Db {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend("get"))?;

        row.map(|(raw,)| decode(path, &raw)).transpose()
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let raw = value.to_string();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO kv (path, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(path)
        .bind(&raw)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend("set"))?;

        let _ = self.tx.send(Change {
            path: path.to_string(),
            value,
        });
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        // '0' is the byte after '/', so this range is exactly "path/...".
        let lo = format!("{path}/");
        let hi = format!("{path}0");
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT path, value
            FROM kv
            WHERE path >= ? AND path < ?
            ORDER BY path
            "#,
        )
        .bind(&lo)
        .bind(&hi)
        .fetch_all(&self.pool)
        .await
        .map_err(backend("children"))?;

        rows.iter()
            .filter_map(|(p, raw)| child_key(p, path).map(|k| (k, p, raw)))
            .map(|(k, p, raw)| Ok((k.to_string(), decode(p, raw)?)))
            .collect()
    }

    fn changes(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
