// facility-sync/src/log_store.rs

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::contract::LogStore;
use crate::dedup_log::LogEntry;
use crate::error::Result;

/// Entries a [`MemoryLogStore`] keeps unless told otherwise.
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Process-local store, used when no database is configured and in tests.
/// Holds at most `capacity` entries; the oldest are evicted first.
#[derive(Debug)]
pub struct MemoryLogStore {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryLogStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        // A poisoned lock still holds consistent entries: every write is a single push.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn count_since(&self, dedup_key: &str, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .lock()
            .iter()
            .filter(|e| e.dedup_key == dedup_key && e.timestamp >= since)
            .count() as u64)
    }

    async fn insert(&self, entry: &LogEntry) -> Result<()> {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Ok(())
    }
}

#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteLogStore;

#[cfg(feature = "sqlite-store")]
mod sqlite {
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

    use crate::contract::LogStore;
    use crate::dedup_log::LogEntry;
    use crate::error::Result;

    /// SQLite-backed store. Timestamps are kept as milliseconds since the epoch.
    pub struct SqliteLogStore {
        pool: SqlitePool,
    }

    impl SqliteLogStore {
        pub async fn open(path: &Path) -> Result<Self> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(
                    SqliteConnectOptions::new()
                        .filename(path)
                        .create_if_missing(true)
                        .journal_mode(SqliteJournalMode::Wal),
                )
                .await?;
            Self::from_pool(pool).await
        }

        /// Private in-memory database, one connection so every query sees it.
        pub async fn in_memory() -> Result<Self> {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?;
            Self::from_pool(pool).await
        }

        async fn from_pool(pool: SqlitePool) -> Result<Self> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS service_logs (
                    id TEXT PRIMARY KEY,
                    ts_ms INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    trace TEXT,
                    payload TEXT,
                    dedup_key TEXT NOT NULL,
                    callsite TEXT NOT NULL,
                    service TEXT NOT NULL
                )
                "#,
            )
            .execute(&pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_service_logs_key_ts ON service_logs(dedup_key, ts_ms)",
            )
            .execute(&pool)
            .await?;

            tracing::debug!("Initialised service_logs schema");
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl LogStore for SqliteLogStore {
        async fn count_since(&self, dedup_key: &str, since: DateTime<Utc>) -> Result<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM service_logs WHERE dedup_key = ? AND ts_ms >= ?",
            )
            .bind(dedup_key)
            .bind(since.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
            Ok(count.max(0) as u64)
        }

        async fn insert(&self, entry: &LogEntry) -> Result<()> {
            sqlx::query(
                "INSERT INTO service_logs (id, ts_ms, level, message, trace, payload, dedup_key, callsite, service) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.id.to_string())
            .bind(entry.timestamp.timestamp_millis())
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(entry.trace.as_deref())
            .bind(entry.payload.as_deref())
            .bind(&entry.dedup_key)
            .bind(&entry.callsite)
            .bind(&entry.service)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

}
