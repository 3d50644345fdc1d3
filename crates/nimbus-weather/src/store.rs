//! SQLite-backed forecast cache shared by every process that renders weather.
//!
//! There is no in-memory layer: each call reads or writes the database file, so
//! a freshly started background process sees exactly what the foreground wrote.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::freshness::{self, now_ms};
use crate::types::{CacheEntry, CacheStats, ForecastDocument};

/// Bumped only for additive changes; older readers ignore unknown columns.
const SCHEMA_VERSION: i64 = 2;

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Columns added after the first schema, with the definition used to add them.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("locale", "TEXT NOT NULL DEFAULT ''"),
    ("latitude", "REAL"),
    ("longitude", "REAL"),
    ("created_at", "INTEGER NOT NULL DEFAULT 0"),
];

const SELECT_COLUMNS: &str =
    "location_id, weather_data, last_updated, locale, latitude, longitude, created_at";

/// Durable forecast cache keyed by location id.
pub struct WeatherStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for WeatherStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherStore").field("path", &self.path).finish()
    }
}

impl WeatherStore {
    /// Open (creating if needed) the cache at `path` and initialize it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Init(format!("{}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| StorageError::Init(format!("{}: {}", path.display(), e)))?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.initialize()?;
        tracing::debug!("Opened weather cache at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Init(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.initialize()?;
        Ok(store)
    }


    /// Create the table and index if absent and add any missing columns.
    ///
    /// Safe to call repeatedly and from several processes; never drops data.
    pub fn initialize(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let init = |e: rusqlite::Error| StorageError::Init(e.to_string());

        conn.busy_timeout(BUSY_TIMEOUT).map_err(init)?;
        // In-memory databases report "memory" here; only file-backed ones switch to WAL.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(init)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS weather_cache (
                location_id TEXT PRIMARY KEY,
                weather_data TEXT NOT NULL,
                last_updated INTEGER NOT NULL,
                locale TEXT NOT NULL DEFAULT '',
                latitude REAL,
                longitude REAL,
                created_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_weather_cache_last_updated
                ON weather_cache(last_updated);

            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )
        .map_err(init)?;

        let mut stmt = conn.prepare("PRAGMA table_info(weather_cache)").map_err(init)?;
        let existing = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(init)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(init)?;
        drop(stmt);

        for (column, definition) in ADDITIVE_COLUMNS {
            if !existing.iter().any(|c| c == column) {
                tracing::info!("Migrating weather cache: adding column {}", column);
                conn.execute_batch(&format!(
                    "ALTER TABLE weather_cache ADD COLUMN {} {};",
                    column, definition
                ))
                .map_err(init)?;
            }
        }

        // Never lower the recorded version: a newer build may share this file.
        conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![SCHEMA_VERSION],
        )
        .map_err(init)?;

        Ok(())
    }

    /// Recorded schema version (the highest any process has written).
    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map(|v| v.unwrap_or(0))
        .map_err(|e| StorageError::Read(e.to_string()))
    }

    /// Insert or replace the entry for `location_id` in one statement.
    ///
    /// `created_at` is kept from the first write of the key.
    pub fn upsert(
        &self,
        location_id: &str,
        forecast: &ForecastDocument,
        locale: &str,
        latitude: f64,
        longitude: f64,
        now_ms: i64,
    ) -> Result<(), StorageError> {
        let weather_data =
            serde_json::to_string(forecast).map_err(|e| StorageError::Write(e.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO weather_cache
                (location_id, weather_data, last_updated, locale, latitude, longitude, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?3)
            ON CONFLICT(location_id) DO UPDATE SET
                weather_data = excluded.weather_data,
                last_updated = excluded.last_updated,
                locale = excluded.locale,
                latitude = excluded.latitude,
                longitude = excluded.longitude
            "#,
            params![location_id, weather_data, now_ms, locale, latitude, longitude],
        )
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    /// Point lookup. Missing, corrupt, and unreadable rows all read as `None`.
    pub fn get(&self, location_id: &str) -> Option<CacheEntry> {
        match self.try_get(location_id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Weather cache read failed for {}: {}", location_id, e);
                None
            }
        }
    }

    /// Point lookup that reports read failures instead of degrading.
    pub fn try_get(&self, location_id: &str) -> Result<Option<CacheEntry>, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM weather_cache WHERE location_id = ?1", SELECT_COLUMNS),
                params![location_id],
                RawRow::from_row,
            )
            .optional()
            .map_err(|e| StorageError::Read(e.to_string()))?;

        Ok(row.and_then(RawRow::into_entry))
    }

    /// True if an entry exists and is younger than `serve_threshold`.
    pub fn is_fresh(&self, location_id: &str, serve_threshold: Duration) -> bool {
        self.is_fresh_at(location_id, serve_threshold, now_ms())
    }

    pub fn is_fresh_at(&self, location_id: &str, serve_threshold: Duration, now_ms: i64) -> bool {
        let conn = self.conn.lock();
        let last_updated: Result<Option<i64>, _> = conn
            .query_row(
                "SELECT last_updated FROM weather_cache WHERE location_id = ?1",
                params![location_id],
                |row| row.get(0),
            )
            .optional();

        match last_updated {
            Ok(Some(ts)) => freshness::is_fresh(ts, now_ms, serve_threshold),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Weather cache freshness check failed for {}: {}", location_id, e);
                false
            }
        }
    }

    /// Every fresh entry, keyed by location id.
    pub fn get_all_fresh(
        &self,
        serve_threshold: Duration,
    ) -> Result<HashMap<String, CacheEntry>, StorageError> {
        self.get_all_fresh_at(serve_threshold, now_ms())
    }

    pub fn get_all_fresh_at(
        &self,
        serve_threshold: Duration,
        now_ms: i64,
    ) -> Result<HashMap<String, CacheEntry>, StorageError> {
        let cutoff = freshness::fresh_cutoff(now_ms, serve_threshold);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM weather_cache WHERE last_updated > ?1",
                SELECT_COLUMNS
            ))
            .map_err(|e| StorageError::Read(e.to_string()))?;

        let rows = stmt
            .query_map(params![cutoff], RawRow::from_row)
            .map_err(|e| StorageError::Read(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Read(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(RawRow::into_entry)
            .map(|entry| (entry.location_id.clone(), entry))
            .collect())
    }

    /// Ids of every cached location, oldest first.
    pub fn list_location_ids(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT location_id FROM weather_cache ORDER BY last_updated ASC")
            .map_err(|e| StorageError::Read(e.to_string()))?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| StorageError::Read(e.to_string()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(ids)
    }

    /// Remove the entry for a deleted location. Returns whether a row existed.
    pub fn delete(&self, location_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM weather_cache WHERE location_id = ?1", params![location_id])
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(count > 0)
    }

    /// Remove entries at or past `retention_threshold`, whatever their location.
    pub fn evict_older_than(&self, retention_threshold: Duration) -> Result<usize, StorageError> {
        self.evict_older_than_at(retention_threshold, now_ms())
    }

    pub fn evict_older_than_at(
        &self,
        retention_threshold: Duration,
        now_ms: i64,
    ) -> Result<usize, StorageError> {
        let retention_ms = i64::try_from(retention_threshold.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(retention_ms);
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM weather_cache WHERE last_updated <= ?1", params![cutoff])
            .map_err(|e| StorageError::Write(e.to_string()))?;
        if count > 0 {
            tracing::info!("Evicted {} expired weather cache entries", count);
        }
        Ok(count)
    }

    /// Totals and age bounds for diagnostics.
    pub fn stats(&self, serve_threshold: Duration) -> Result<CacheStats, StorageError> {
        self.stats_at(serve_threshold, now_ms())
    }

    pub fn stats_at(&self, serve_threshold: Duration, now_ms: i64) -> Result<CacheStats, StorageError> {
        let cutoff = freshness::fresh_cutoff(now_ms, serve_threshold);
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN last_updated > ?1 THEN 1 ELSE 0 END), 0),
                   MIN(last_updated),
                   MAX(last_updated)
            FROM weather_cache
            "#,
            params![cutoff],
            |row| {
                Ok(CacheStats {
                    total: row.get::<_, i64>(0)?.max(0) as u64,
                    fresh: row.get::<_, i64>(1)?.max(0) as u64,
                    oldest: row.get(2)?,
                    newest: row.get(3)?,
                })
            },
        )
        .map_err(|e| StorageError::Read(e.to_string()))
    }

    /// Run a store call on the blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&WeatherStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::Read(format!("store task failed: {}", e)))?
    }
}

/// Row as read from SQLite, before the forecast JSON is decoded.
struct RawRow {
    location_id: String,
    weather_data: String,
    last_updated: i64,
    locale: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    created_at: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            location_id: row.get(0)?,
            weather_data: row.get(1)?,
            last_updated: row.get(2)?,
            locale: row.get(3)?,
            latitude: row.get(4)?,
            longitude: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    /// Decode the forecast; corrupt rows are logged and dropped.
    fn into_entry(self) -> Option<CacheEntry> {
        let forecast: ForecastDocument = match serde_json::from_str(&self.weather_data) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    "Ignoring corrupt weather cache row for {}: {}",
                    self.location_id,
                    e
                );
                return None;
            }
        };

        Some(CacheEntry {
            latitude: self.latitude.unwrap_or(forecast.latitude),
            longitude: self.longitude.unwrap_or(forecast.longitude),
            location_id: self.location_id,
            forecast,
            last_updated: self.last_updated,
            locale: self.locale,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::types::fixtures::forecast;
    use tempfile::tempdir;

    const SERVE: Duration = Duration::from_millis(1_800_000);

    #[test]
    fn test_upsert_and_get() {
        let store = WeatherStore::in_memory().unwrap();
        let doc = forecast(40.0, -74.0, 70.0);

        store.upsert("loc-1", &doc, "en", 40.0, -74.0, 1000).unwrap();
        let entry = store.get("loc-1").unwrap();

        assert_eq!(entry.forecast, doc);
        assert_eq!(entry.last_updated, 1000);
        assert_eq!(entry.locale, "en");
        assert_eq!(entry.created_at, 1000);
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = WeatherStore::in_memory().unwrap();
        assert!(store.get("nope").is_none());
        assert!(!store.is_fresh_at("nope", SERVE, 0));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = WeatherStore::in_memory().unwrap();
        let doc = forecast(40.0, -74.0, 70.0);

        store.upsert("loc-1", &doc, "en", 40.0, -74.0, 1000).unwrap();
        store.upsert("loc-1", &doc, "en", 40.0, -74.0, 1000).unwrap();

        let all = store.get_all_fresh_at(SERVE, 2000).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(store.stats_at(SERVE, 2000).unwrap().total, 1);
    }

    #[test]
    fn test_upsert_replaces_and_keeps_created_at() {
        let store = WeatherStore::in_memory().unwrap();
        store.upsert("loc-1", &forecast(40.0, -74.0, 70.0), "en", 40.0, -74.0, 1000).unwrap();
        store.upsert("loc-1", &forecast(41.0, -75.0, 55.0), "fr", 41.0, -75.0, 5000).unwrap();

        let entry = store.get("loc-1").unwrap();
        assert_eq!(entry.forecast.current.temperature, 55.0);
        assert_eq!(entry.locale, "fr");
        assert_eq!(entry.latitude, 41.0);
        assert_eq!(entry.last_updated, 5000);
        assert_eq!(entry.created_at, 1000);
    }

    #[test]
    fn test_freshness_scenario() {
        let store = WeatherStore::in_memory().unwrap();
        let doc = forecast(40.0, -74.0, 70.0);
        store.upsert("loc-1", &doc, "en", 40.0, -74.0, 1000).unwrap();

        assert!(store.is_fresh_at("loc-1", SERVE, 2000));
        assert!(!store.is_fresh_at("loc-1", SERVE, 1_802_001));
        // stale entries are still served as-is
        assert_eq!(store.get("loc-1").unwrap().forecast, doc);
    }

    #[test]
    fn test_get_all_fresh_filters_stale() {
        let store = WeatherStore::in_memory().unwrap();
        store.upsert("old", &forecast(1.0, 1.0, 1.0), "en", 1.0, 1.0, 0).unwrap();
        store.upsert("new", &forecast(2.0, 2.0, 2.0), "en", 2.0, 2.0, 3_000_000).unwrap();

        let fresh = store.get_all_fresh_at(SERVE, 3_500_000).unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh.contains_key("new"));
    }

    #[test]
    fn test_corrupt_row_reads_as_absent() {
        let store = WeatherStore::in_memory().unwrap();
        store.upsert("good", &forecast(1.0, 1.0, 1.0), "en", 1.0, 1.0, 1000).unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO weather_cache (location_id, weather_data, last_updated) VALUES ('bad', '{not json', 1000)",
                [],
            )
            .unwrap();

        assert!(store.get("bad").is_none());
        let fresh = store.get_all_fresh_at(SERVE, 2000).unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh.contains_key("good"));
    }

    #[test]
    fn test_delete() {
        let store = WeatherStore::in_memory().unwrap();
        store.upsert("loc-1", &forecast(1.0, 1.0, 1.0), "en", 1.0, 1.0, 1000).unwrap();

        assert!(store.delete("loc-1").unwrap());
        assert!(store.get("loc-1").is_none());
        assert!(!store.delete("loc-1").unwrap());
    }

    #[test]
    fn test_evict_older_than() {
        let store = WeatherStore::in_memory().unwrap();
        let day = Duration::from_secs(24 * 60 * 60);
        let day_ms = day.as_millis() as i64;
        store.upsert("removed-long-ago", &forecast(1.0, 1.0, 1.0), "en", 1.0, 1.0, 0).unwrap();
        store.upsert("recent", &forecast(2.0, 2.0, 2.0), "en", 2.0, 2.0, day_ms).unwrap();

        let evicted = store.evict_older_than_at(day, day_ms).unwrap();

        assert_eq!(evicted, 1);
        assert!(store.get("removed-long-ago").is_none());
        assert!(store.get("recent").is_some());
    }

    #[test]
    fn test_stats() {
        let store = WeatherStore::in_memory().unwrap();
        assert_eq!(store.stats_at(SERVE, 0).unwrap(), CacheStats::default());

        store.upsert("a", &forecast(1.0, 1.0, 1.0), "en", 1.0, 1.0, 0).unwrap();
        store.upsert("b", &forecast(2.0, 2.0, 2.0), "en", 2.0, 2.0, 3_000_000).unwrap();

        let stats = store.stats_at(SERVE, 3_500_000).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.oldest, Some(0));
        assert_eq!(stats.newest, Some(3_000_000));
    }

    #[test]
    fn test_initialize_is_idempotent_and_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("weather.db");
        let store = WeatherStore::open(&path).unwrap();
        store.upsert("loc-1", &forecast(1.0, 1.0, 1.0), "en", 1.0, 1.0, 1000).unwrap();

        store.initialize().unwrap();
        store.initialize().unwrap();
        let reopened = WeatherStore::open(&path).unwrap();

        assert!(reopened.get("loc-1").is_some());
        assert_eq!(reopened.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrates_old_schema_additively() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weather.db");
        let doc = forecast(40.0, -74.0, 70.0);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE weather_cache (
                    location_id TEXT PRIMARY KEY,
                    weather_data TEXT NOT NULL,
                    last_updated INTEGER NOT NULL
                );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO weather_cache VALUES ('legacy', ?1, 1000)",
                params![serde_json::to_string(&doc).unwrap()],
            )
            .unwrap();
        }

        let store = WeatherStore::open(&path).unwrap();
        let entry = store.get("legacy").unwrap();

        assert_eq!(entry.forecast, doc);
        assert_eq!(entry.latitude, 40.0);
        assert_eq!(entry.longitude, -74.0);
        assert_eq!(entry.locale, "");
    }

    #[test]
    fn test_schema_version_never_lowered() {
        let store = WeatherStore::in_memory().unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE schema_meta SET value = 99 WHERE key = 'schema_version'", [])
            .unwrap();

        store.initialize().unwrap();
        assert_eq!(store.schema_version().unwrap(), 99);
    }

    #[tokio::test]
    async fn test_blocking_runs_store_calls() {
        let store = Arc::new(WeatherStore::in_memory().unwrap());
        let doc = forecast(1.0, 1.0, 1.0);

        store
            .blocking(move |s| s.upsert("loc-1", &doc, "en", 1.0, 1.0, 1000))
            .await
            .unwrap();
        let entry = store.blocking(|s| Ok(s.get("loc-1"))).await.unwrap();

        assert!(entry.is_some());
    }
}
