#[cfg(test)]
use std::collections::HashMap;
use std::path::Path;
#[cfg(test)]
use std::sync::Mutex;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// The two independent cache namespaces: raw search pages keyed by the
/// query term, extracted article bodies keyed by absolute URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    SearchResults,
    Articles,
}

impl Namespace {
    fn table(self) -> &'static str {
        match self {
            Namespace::SearchResults => "search_results",
            Namespace::Articles => "articles",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Key-value persistence shared by all in-flight resolutions. Writes are
/// first-writer-wins: a `put` for an existing key is a no-op, so concurrent
/// fetchers racing on the same key cannot change what readers observe.
pub trait DocumentCache {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, CacheError>;
    async fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), CacheError>;
}

/// File-backed cache in WAL mode, safe for concurrent readers and writers.
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        debug!(path = %path.display(), "cache database opened");
        Self::with_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        for ns in [Namespace::SearchResults, Namespace::Articles] {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                ns.table()
            );
            sqlx::query(&sql).execute(&pool).await?;
        }
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Append one completed question/answer exchange to the query log.
    pub async fn record_exchange(&self, input: &str, output: &str) -> Result<(), CacheError> {
        sqlx::query("INSERT INTO queries (input, output) VALUES (?, ?)")
            .bind(input)
            .bind(output)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl DocumentCache for SqliteCache {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, CacheError> {
        let sql = format!("SELECT value FROM {} WHERE key = ?", ns.table());
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0).map_err(CacheError::Storage)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), CacheError> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (key, value) VALUES (?, ?)",
            ns.table()
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Non-persistent cache with the same first-writer-wins contract.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(Namespace, String), String>>,
}

#[cfg(test)]
impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl DocumentCache for MemoryCache {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&(ns, key.to_string())).cloned())
    }

    async fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry((ns, key.to_string()))
            .or_insert_with(|| value.to_string());
        Ok(())
    }
}
