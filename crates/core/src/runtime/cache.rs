//! SQLite-backed snippet cache with TTL expiry and LRU eviction. Keyed by
//! the normalized-code digest, so whitespace variants of a snippet share an
//! entry. The cache exclusively owns its database file; writes serialize
//! through the database, readers are concurrent.

use mfp_shared::hashing::hash_code;
use mfp_shared::{CacheEntry, CacheSummary, MfpError, MfpResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::future::Future;
use std::path::Path;
use tokio::time::{timeout, Duration};

// Database operation timeout to prevent indefinite hangs on locks.
const DB_TIMEOUT: Duration = Duration::from_secs(10);

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS code_cache (
    id TEXT PRIMARY KEY,
    code TEXT NOT NULL,
    description TEXT NOT NULL,
    servers_used TEXT NOT NULL,
    swagger_hash TEXT NOT NULL,
    result_summary TEXT NOT NULL DEFAULT '',
    created_at REAL NOT NULL,
    last_used_at REAL NOT NULL,
    use_count INTEGER NOT NULL DEFAULT 1,
    ttl_seconds INTEGER NOT NULL
)";

const CREATE_INDEXES_SQL: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_cache_last_used ON code_cache(last_used_at)",
    "CREATE INDEX IF NOT EXISTS idx_cache_description ON code_cache(description)",
];

type EntryRow = (
    String, // id
    String, // code
    String, // description
    String, // servers_used (JSON)
    String, // swagger_hash
    String, // result_summary
    f64,    // created_at
    f64,    // last_used_at
    i64,    // use_count
    i64,    // ttl_seconds
);

pub struct CacheStore {
    pool: SqlitePool,
    ttl_seconds: i64,
    max_entries: i64,
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

async fn guarded<T, F>(operation: &str, fut: F) -> MfpResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    timeout(DB_TIMEOUT, fut)
        .await
        .map_err(|_| MfpError::Cache(format!("{operation} timed out after {}s", DB_TIMEOUT.as_secs())))?
        .map_err(|e| MfpError::Cache(format!("{operation} failed: {e}")))
}

impl CacheStore {
    /// Open (creating if missing) the cache database.
    pub async fn connect(
        db_path: &Path,
        ttl_seconds: i64,
        max_entries: i64,
    ) -> MfpResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MfpError::Cache(format!("Failed to create cache directory: {e}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| MfpError::Cache(format!("Failed to open cache database: {e}")))?;

        Ok(Self {
            pool,
            ttl_seconds,
            max_entries,
        })
    }

    /// Create the schema if absent. An existing database with a stale
    /// schema gets a best-effort `ALTER`; if that cannot reconcile it, the
    /// table is dropped and recreated.
    pub async fn initialize(&self) -> MfpResult<()> {
        guarded("schema create", sqlx::query(CREATE_TABLE_SQL).execute(&self.pool)).await?;
        for sql in CREATE_INDEXES_SQL {
            guarded("index create", sqlx::query(sql).execute(&self.pool)).await?;
        }

        // Probe a column added after the first schema generation; a failure
        // means an old table shape on disk.
        let probe = sqlx::query("SELECT result_summary FROM code_cache LIMIT 1")
            .fetch_optional(&self.pool)
            .await;
        if probe.is_err() {
            tracing::warn!("cache schema mismatch detected, migrating");
            let altered = sqlx::query(
                "ALTER TABLE code_cache ADD COLUMN result_summary TEXT NOT NULL DEFAULT ''",
            )
            .execute(&self.pool)
            .await;
            if altered.is_err() {
                tracing::warn!("cache schema migration failed, recreating table");
                guarded(
                    "schema drop",
                    sqlx::query("DROP TABLE IF EXISTS code_cache").execute(&self.pool),
                )
                .await?;
                guarded("schema create", sqlx::query(CREATE_TABLE_SQL).execute(&self.pool))
                    .await?;
                for sql in CREATE_INDEXES_SQL {
                    guarded("index create", sqlx::query(sql).execute(&self.pool)).await?;
                }
            }
        }

        tracing::info!("cache initialized");
        Ok(())
    }

    /// Upsert a successfully executed snippet. A hit on the same id bumps
    /// `use_count` and `last_used_at` and overwrites the mutable metadata;
    /// LRU eviction runs after every put.
    pub async fn put(
        &self,
        code: &str,
        description: &str,
        servers_used: &[String],
        swagger_hash: &str,
        result_summary: &str,
    ) -> MfpResult<String> {
        let id = hash_code(code);
        let now = now_epoch();
        let servers_json = serde_json::to_string(servers_used)
            .map_err(|e| MfpError::Cache(format!("Failed to encode servers_used: {e}")))?;

        guarded(
            "cache put",
            sqlx::query(
                "INSERT INTO code_cache \
                     (id, code, description, servers_used, swagger_hash, result_summary, \
                      created_at, last_used_at, use_count, ttl_seconds) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                     use_count = use_count + 1, \
                     last_used_at = excluded.last_used_at, \
                     description = excluded.description, \
                     servers_used = excluded.servers_used, \
                     swagger_hash = excluded.swagger_hash, \
                     result_summary = excluded.result_summary, \
                     ttl_seconds = excluded.ttl_seconds",
            )
            .bind(&id)
            .bind(code)
            .bind(description)
            .bind(&servers_json)
            .bind(swagger_hash)
            .bind(result_summary)
            .bind(now)
            .bind(now)
            .bind(self.ttl_seconds)
            .execute(&self.pool),
        )
        .await?;

        tracing::debug!(id = %&id[..12], "cache stored");
        self.evict_lru().await;
        Ok(id)
    }

    /// Fetch an entry by id. Entries idle past their TTL are logically
    /// absent and physically removed here; a hit refreshes `last_used_at`
    /// and bumps `use_count`.
    pub async fn get(&self, id: &str) -> MfpResult<Option<CacheEntry>> {
        let now = now_epoch();

        let row: Option<EntryRow> = guarded(
            "cache get",
            sqlx::query_as(
                "SELECT id, code, description, servers_used, swagger_hash, result_summary, \
                        created_at, last_used_at, use_count, ttl_seconds \
                 FROM code_cache WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?;

        let Some(row) = row else {
            tracing::debug!(id = %truncate_id(id), "cache miss");
            return Ok(None);
        };

        let mut entry = row_to_entry(row)?;

        if now - entry.last_used_at > entry.ttl_seconds as f64 {
            guarded(
                "cache expire",
                sqlx::query("DELETE FROM code_cache WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;
            tracing::debug!(id = %truncate_id(id), "cache entry expired");
            return Ok(None);
        }

        guarded(
            "cache touch",
            sqlx::query(
                "UPDATE code_cache SET last_used_at = ?, use_count = use_count + 1 WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        entry.last_used_at = now;
        entry.use_count += 1;
        tracing::debug!(id = %truncate_id(id), "cache hit");
        Ok(Some(entry))
    }

    /// Case-insensitive substring search over descriptions. Expired entries
    /// are filtered in SQL; results come newest-use first.
    pub async fn search(
        &self,
        query: Option<&str>,
        limit: i64,
    ) -> MfpResult<Vec<CacheSummary>> {
        let now = now_epoch();
        type SummaryRow = (String, String, String, String, i64, f64);

        let rows: Vec<SummaryRow> = if let Some(query) = query {
            // Escape LIKE wildcards so a literal % or _ in the query cannot
            // widen the match.
            let escaped = query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            let pattern = format!("%{escaped}%");
            guarded(
                "cache search",
                sqlx::query_as(
                    "SELECT id, description, servers_used, result_summary, use_count, created_at \
                     FROM code_cache \
                     WHERE (? - last_used_at) <= ttl_seconds AND description LIKE ? ESCAPE '\\' \
                     ORDER BY last_used_at DESC LIMIT ?",
                )
                .bind(now)
                .bind(&pattern)
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await?
        } else {
            guarded(
                "cache search",
                sqlx::query_as(
                    "SELECT id, description, servers_used, result_summary, use_count, created_at \
                     FROM code_cache \
                     WHERE (? - last_used_at) <= ttl_seconds \
                     ORDER BY last_used_at DESC LIMIT ?",
                )
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await?
        };

        rows.into_iter()
            .map(|(id, description, servers_json, result_summary, use_count, created_at)| {
                Ok(CacheSummary {
                    id,
                    description,
                    servers_used: decode_servers(&servers_json)?,
                    result_summary,
                    use_count,
                    created_at,
                })
            })
            .collect()
    }

    /// Drop every entry compiled against a stale swagger hash.
    pub async fn invalidate_by_swagger_hash(&self, swagger_hash: &str) -> MfpResult<u64> {
        let result = guarded(
            "cache invalidate",
            sqlx::query("DELETE FROM code_cache WHERE swagger_hash = ?")
                .bind(swagger_hash)
                .execute(&self.pool),
        )
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(swagger_hash = %truncate_id(swagger_hash), count, "cache invalidated");
        }
        Ok(count)
    }

    /// Sweep entries idle past their TTL. Run at serve startup.
    pub async fn cleanup_expired(&self) -> MfpResult<u64> {
        let now = now_epoch();
        let result = guarded(
            "cache cleanup",
            sqlx::query("DELETE FROM code_cache WHERE (? - last_used_at) > ttl_seconds")
                .bind(now)
                .execute(&self.pool),
        )
        .await?;

        let count = result.rows_affected();
        tracing::debug!(count, "expired cache entries cleaned");
        Ok(count)
    }

    /// Delete oldest-used entries until the count is back within bounds.
    /// Eviction failures are logged, not fatal: the put already landed.
    async fn evict_lru(&self) {
        let count: Result<(i64,), _> = sqlx::query_as("SELECT COUNT(*) FROM code_cache")
            .fetch_one(&self.pool)
            .await;

        let count = match count {
            Ok((n,)) => n,
            Err(e) => {
                tracing::warn!(error = %e, "cache eviction count failed");
                return;
            }
        };

        if count <= self.max_entries {
            return;
        }

        let excess = count - self.max_entries;
        let evicted = sqlx::query(
            "DELETE FROM code_cache WHERE id IN ( \
                 SELECT id FROM code_cache ORDER BY last_used_at ASC LIMIT ? \
             )",
        )
        .bind(excess)
        .execute(&self.pool)
        .await;

        match evicted {
            Ok(_) => tracing::info!(count = excess, "cache evicted lru entries"),
            Err(e) => tracing::warn!(error = %e, "cache eviction failed"),
        }
    }

    #[cfg(test)]
    pub(crate) async fn entry_count(&self) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM code_cache")
            .fetch_one(&self.pool)
            .await
            .unwrap();
        count
    }

    #[cfg(test)]
    pub(crate) async fn age_entry(&self, id: &str, seconds: f64) {
        sqlx::query("UPDATE code_cache SET last_used_at = last_used_at - ? WHERE id = ?")
            .bind(seconds)
            .bind(id)
            .execute(&self.pool)
            .await
            .unwrap();
    }
}

fn truncate_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn decode_servers(json: &str) -> MfpResult<Vec<String>> {
    serde_json::from_str(json)
        .map_err(|e| MfpError::Cache(format!("Corrupt servers_used column: {e}")))
}

fn row_to_entry(row: EntryRow) -> MfpResult<CacheEntry> {
    let (
        id,
        code,
        description,
        servers_json,
        swagger_hash,
        result_summary,
        created_at,
        last_used_at,
        use_count,
        ttl_seconds,
    ) = row;
    Ok(CacheEntry {
        id,
        code,
        description,
        servers_used: decode_servers(&servers_json)?,
        swagger_hash,
        result_summary,
        created_at,
        last_used_at,
        use_count,
        ttl_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store(ttl: i64, max_entries: i64) -> (CacheStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::connect(&dir.path().join("cache.db"), ttl, max_entries)
            .await
            .unwrap();
        store.initialize().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips_code() {
        let (store, _dir) = test_store(3600, 10).await;
        let code = "result = 42";
        let id = store
            .put(code, "compute 42", &["weather".into()], "hash1", "42")
            .await
            .unwrap();

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.code, code);
        assert_eq!(entry.description, "compute 42");
        assert_eq!(entry.servers_used, vec!["weather"]);
        assert_eq!(entry.result_summary, "42");
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_miss() {
        let (store, _dir) = test_store(3600, 10).await;
        assert!(store.get("not-a-real-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_normalized_code_shares_id_and_bumps_use_count() {
        let (store, _dir) = test_store(3600, 10).await;
        let first = store
            .put("result = 99", "first", &[], "h", "")
            .await
            .unwrap();
        // Whitespace variant of the same snippet.
        let second = store
            .put("result = 99   \n\n", "second", &[], "h", "")
            .await
            .unwrap();
        assert_eq!(first, second);

        let entry = store.get(&first).await.unwrap().unwrap();
        // Two puts plus the get's own touch.
        assert_eq!(entry.use_count, 3);
        // Conflict overwrites the mutable metadata.
        assert_eq!(entry.description, "second");
    }

    #[tokio::test]
    async fn test_get_bumps_use_count_monotonically() {
        let (store, _dir) = test_store(3600, 10).await;
        let id = store.put("result = 1", "d", &[], "h", "").await.unwrap();

        let first = store.get(&id).await.unwrap().unwrap();
        let second = store.get(&id).await.unwrap().unwrap();
        assert!(second.use_count > first.use_count);
    }

    #[tokio::test]
    async fn test_ttl_boundary_within_is_hit_past_is_miss() {
        let (store, _dir) = test_store(100, 10).await;
        let id = store.put("result = 'a'", "d", &[], "h", "").await.unwrap();

        // Idle time right at the TTL (expiry is strictly greater-than).
        store.age_entry(&id, 99.5).await;
        assert!(store.get(&id).await.unwrap().is_some());

        // The hit refreshed last_used_at; age past the boundary now.
        store.age_entry(&id, 101.5).await;
        assert!(store.get(&id).await.unwrap().is_none());
        // Expired entries are physically removed on touch.
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_search_matches_description_substring_case_insensitive() {
        let (store, _dir) = test_store(3600, 10).await;
        store
            .put("result = 1", "Get weather data", &["weather".into()], "h1", "")
            .await
            .unwrap();
        store
            .put("result = 2", "list hotels", &["hotel".into()], "h2", "")
            .await
            .unwrap();
        store
            .put("result = 3", "book HOTEL room", &["hotel".into()], "h3", "")
            .await
            .unwrap();

        let results = store.search(Some("hotel"), 50).await.unwrap();
        assert_eq!(results.len(), 2);
        let descriptions: Vec<&str> = results.iter().map(|e| e.description.as_str()).collect();
        assert!(descriptions.contains(&"list hotels"));
        assert!(descriptions.contains(&"book HOTEL room"));
    }

    #[tokio::test]
    async fn test_search_orders_by_last_used_desc_and_caps_at_limit() {
        let (store, _dir) = test_store(3600, 10).await;
        let a = store.put("result = 1", "alpha", &[], "h", "").await.unwrap();
        let b = store.put("result = 2", "beta", &[], "h", "").await.unwrap();
        let c = store.put("result = 3", "gamma", &[], "h", "").await.unwrap();
        store.age_entry(&a, 30.0).await;
        store.age_entry(&b, 20.0).await;
        store.age_entry(&c, 10.0).await;

        let results = store.search(None, 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].description, "gamma");
        assert_eq!(results[1].description, "beta");
    }

    #[tokio::test]
    async fn test_search_excludes_expired_entries() {
        let (store, _dir) = test_store(100, 10).await;
        let id = store.put("result = 1", "stale entry", &[], "h", "").await.unwrap();
        store.put("result = 2", "fresh entry", &[], "h", "").await.unwrap();
        store.age_entry(&id, 200.0).await;

        let results = store.search(None, 50).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].description, "fresh entry");
    }

    #[tokio::test]
    async fn test_search_escapes_like_wildcards() {
        let (store, _dir) = test_store(3600, 10).await;
        store.put("result = 1", "100% done", &[], "h", "").await.unwrap();
        store.put("result = 2", "fully done", &[], "h", "").await.unwrap();

        let results = store.search(Some("100%"), 50).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].description, "100% done");
    }

    #[tokio::test]
    async fn test_lru_eviction_removes_exactly_the_oldest() {
        let (store, _dir) = test_store(3600, 3).await;
        let first = store.put("result = 1", "one", &[], "h", "").await.unwrap();
        store.age_entry(&first, 300.0).await;
        let second = store.put("result = 2", "two", &[], "h", "").await.unwrap();
        store.age_entry(&second, 200.0).await;
        let third = store.put("result = 3", "three", &[], "h", "").await.unwrap();
        store.age_entry(&third, 100.0).await;

        // The fourth distinct put pushes the count to max_entries + 1 and
        // must evict exactly the smallest last_used_at.
        let fourth = store.put("result = 4", "four", &[], "h", "").await.unwrap();

        assert_eq!(store.entry_count().await, 3);
        assert!(store.get(&first).await.unwrap().is_none());
        assert!(store.get(&second).await.unwrap().is_some());
        assert!(store.get(&third).await.unwrap().is_some());
        assert!(store.get(&fourth).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_by_swagger_hash() {
        let (store, _dir) = test_store(3600, 10).await;
        store.put("result = 1", "a", &[], "old-hash", "").await.unwrap();
        store.put("result = 2", "b", &[], "old-hash", "").await.unwrap();
        store.put("result = 3", "c", &[], "new-hash", "").await.unwrap();

        let removed = store.invalidate_by_swagger_hash("old-hash").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired_sweeps_idle_entries() {
        let (store, _dir) = test_store(100, 10).await;
        let id = store.put("result = 1", "old", &[], "h", "").await.unwrap();
        store.put("result = 2", "new", &[], "h", "").await.unwrap();
        store.age_entry(&id, 500.0).await;

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_initialize_migrates_pre_result_summary_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cache.db");

        // Seed an old-generation table without result_summary.
        {
            let options = SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true);
            let pool = SqlitePool::connect_with(options).await.unwrap();
            sqlx::query(
                "CREATE TABLE code_cache (
                     id TEXT PRIMARY KEY,
                     code TEXT NOT NULL,
                     description TEXT NOT NULL,
                     servers_used TEXT NOT NULL,
                     swagger_hash TEXT NOT NULL,
                     created_at REAL NOT NULL,
                     last_used_at REAL NOT NULL,
                     use_count INTEGER NOT NULL DEFAULT 1,
                     ttl_seconds INTEGER NOT NULL
                 )",
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let store = CacheStore::connect(&db_path, 3600, 10).await.unwrap();
        store.initialize().await.unwrap();

        let id = store.put("result = 1", "migrated", &[], "h", "ok").await.unwrap();
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.result_summary, "ok");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (store, _dir) = test_store(3600, 10).await;
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
    }
}
