//! SQLite backend.
//!
//! Every operation opens its own connection on the blocking pool, so any
//! number of workers (threads or processes) may share one database file.
//! Consistency between them comes from SQLite transactions, not from
//! in-process locks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use albumkit_common::now_millis;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{CacheRecord, DurableCache, DurableKeyValueStore, Record, StoreError, UpdateFn};

/// Database schema version, tracked in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// SQLite-backed [`DurableCache`] and [`DurableKeyValueStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create storage dir {}: {}", parent.display(), e))
            })?;
        }

        let mut conn = open_connection(&db_path)?;
        migrate(&mut conn)?;
        info!(path = %db_path.display(), "Opened offline store");

        Ok(Self { db_path })
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn run<T, F>(&self, label: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join {} task: {}", label, e)))?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;

    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let user_version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS cache_names (
                  name TEXT PRIMARY KEY,
                  created_at_unix_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cache_entries (
                  cache_name TEXT NOT NULL REFERENCES cache_names(name) ON DELETE CASCADE,
                  request_key TEXT NOT NULL,
                  url TEXT NOT NULL,
                  method TEXT NOT NULL,
                  status INTEGER NOT NULL,
                  status_text TEXT NOT NULL,
                  headers_json TEXT NOT NULL,
                  body BLOB NOT NULL,
                  cached_at_unix_ms INTEGER NOT NULL,
                  PRIMARY KEY (cache_name, request_key)
                );

                CREATE TABLE IF NOT EXISTS kv_records (
                  store_name TEXT NOT NULL,
                  record_key TEXT NOT NULL,
                  value_json TEXT NOT NULL,
                  updated_at_unix_ms INTEGER NOT NULL,
                  PRIMARY KEY (store_name, record_key)
                );
                "#,
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            debug!(version = SCHEMA_VERSION, "Created offline store schema");
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        other => Err(StoreError::Backend(format!(
            "unsupported offline store schema version {} (expected {})",
            other, SCHEMA_VERSION
        ))),
    }
}

fn cache_exists(conn: &Connection, cache_name: &str) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM cache_names WHERE name = ?1",
            params![cache_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn insert_entry(
    conn: &Connection,
    cache_name: &str,
    key: &str,
    record: &CacheRecord,
) -> Result<(), StoreError> {
    let headers_json = serde_json::to_string(&record.headers)?;
    conn.execute(
        r#"
        INSERT INTO cache_entries (
          cache_name, request_key, url, method, status, status_text,
          headers_json, body, cached_at_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (cache_name, request_key) DO UPDATE SET
          url = excluded.url,
          method = excluded.method,
          status = excluded.status,
          status_text = excluded.status_text,
          headers_json = excluded.headers_json,
          body = excluded.body,
          cached_at_unix_ms = excluded.cached_at_unix_ms
        "#,
        params![
            cache_name,
            key,
            record.url,
            record.method,
            i64::from(record.status),
            record.status_text,
            headers_json,
            record.body,
            record.cached_at as i64,
        ],
    )?;
    Ok(())
}

fn write_kv(conn: &Connection, store: &str, key: &str, value: &JsonValue) -> Result<(), StoreError> {
    let value_json = serde_json::to_string(value)?;
    conn.execute(
        r#"
        INSERT INTO kv_records (store_name, record_key, value_json, updated_at_unix_ms)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (store_name, record_key) DO UPDATE SET
          value_json = excluded.value_json,
          updated_at_unix_ms = excluded.updated_at_unix_ms
        "#,
        params![store, key, value_json, now_millis() as i64],
    )?;
    Ok(())
}

fn read_kv(conn: &Connection, store: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM kv_records WHERE store_name = ?1 AND record_key = ?2",
            params![store, key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
        .transpose()
}

#[async_trait]
impl DurableCache for SqliteStore {
    async fn open(&self, cache_name: &str) -> Result<(), StoreError> {
        let cache_name = cache_name.to_string();
        self.run("open cache", move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cache_names (name, created_at_unix_ms) VALUES (?1, ?2)",
                params![cache_name, now_millis() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn has(&self, cache_name: &str) -> Result<bool, StoreError> {
        let cache_name = cache_name.to_string();
        self.run("has cache", move |conn| cache_exists(conn, &cache_name))
            .await
    }

    async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
        self.run("list caches", |conn| {
            let mut stmt = conn.prepare("SELECT name FROM cache_names ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn delete_cache(&self, cache_name: &str) -> Result<bool, StoreError> {
        let cache_name = cache_name.to_string();
        self.run("delete cache", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM cache_entries WHERE cache_name = ?1",
                params![cache_name],
            )?;
            let removed = tx.execute("DELETE FROM cache_names WHERE name = ?1", params![cache_name])?;
            tx.commit()?;
            debug!(cache = %cache_name, removed = removed > 0, "Deleted cache");
            Ok(removed > 0)
        })
        .await
    }

    async fn put(
        &self,
        cache_name: &str,
        key: &str,
        record: CacheRecord,
    ) -> Result<(), StoreError> {
        self.put_all(cache_name, vec![(key.to_string(), record)]).await
    }

    async fn put_all(
        &self,
        cache_name: &str,
        records: Vec<(String, CacheRecord)>,
    ) -> Result<(), StoreError> {
        let cache_name = cache_name.to_string();
        self.run("put cache entries", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !cache_exists(&tx, &cache_name)? {
                return Err(StoreError::NotFound(format!("cache {}", cache_name)));
            }
            for (key, record) in &records {
                insert_entry(&tx, &cache_name, key, record)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, cache_name: &str, key: &str) -> Result<Option<CacheRecord>, StoreError> {
        let cache_name = cache_name.to_string();
        let key = key.to_string();
        self.run("get cache entry", move |conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT url, method, status, status_text, headers_json, body, cached_at_unix_ms
                    FROM cache_entries WHERE cache_name = ?1 AND request_key = ?2
                    "#,
                    params![cache_name, key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Vec<u8>>(5)?,
                            row.get::<_, i64>(6)?,
                        ))
                    },
                )
                .optional()?;

            row.map(
                |(url, method, status, status_text, headers_json, body, cached_at)| {
                    Ok::<_, StoreError>(CacheRecord {
                        url,
                        method,
                        status: u16::try_from(status)
                            .map_err(|_| StoreError::DataError(format!("bad status {}", status)))?,
                        status_text,
                        headers: serde_json::from_str(&headers_json)?,
                        body,
                        cached_at: u64::try_from(cached_at).unwrap_or(0),
                    })
                },
            )
            .transpose()
        })
        .await
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError> {
        let cache_name = cache_name.to_string();
        self.run("list cache keys", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_key FROM cache_entries WHERE cache_name = ?1 ORDER BY request_key",
            )?;
            let keys = stmt
                .query_map(params![cache_name], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn delete(&self, cache_name: &str, key: &str) -> Result<bool, StoreError> {
        let cache_name = cache_name.to_string();
        let key = key.to_string();
        self.run("delete cache entry", move |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE cache_name = ?1 AND request_key = ?2",
                params![cache_name, key],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[async_trait]
impl DurableKeyValueStore for SqliteStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let store = store.to_string();
        let key = key.to_string();
        self.run("get record", move |conn| read_kv(conn, &store, &key))
            .await
    }

    async fn put(&self, store: &str, key: &str, value: JsonValue) -> Result<(), StoreError> {
        let store = store.to_string();
        let key = key.to_string();
        self.run("put record", move |conn| write_kv(conn, &store, &key, &value))
            .await
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool, StoreError> {
        let store = store.to_string();
        let key = key.to_string();
        self.run("delete record", move |conn| {
            let removed = conn.execute(
                "DELETE FROM kv_records WHERE store_name = ?1 AND record_key = ?2",
                params![store, key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>, StoreError> {
        let store = store.to_string();
        self.run("list record keys", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record_key FROM kv_records WHERE store_name = ?1 ORDER BY record_key",
            )?;
            let keys = stmt
                .query_map(params![store], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Record>, StoreError> {
        let store = store.to_string();
        self.run("list records", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record_key, value_json FROM kv_records WHERE store_name = ?1 ORDER BY record_key",
            )?;
            let rows = stmt
                .query_map(params![store], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(key, value_json)| {
                    Ok::<_, StoreError>(Record {
                        key,
                        value: serde_json::from_str(&value_json)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn update(
        &self,
        store: &str,
        key: &str,
        f: UpdateFn,
    ) -> Result<Option<JsonValue>, StoreError> {
        let store = store.to_string();
        let key = key.to_string();
        self.run("update record", move |conn| {
            // IMMEDIATE takes the write lock before the read.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_kv(&tx, &store, &key)?;
            let next = f(current);
            match next {
                Some(ref value) => write_kv(&tx, &store, &key, value)?,
                None => {
                    tx.execute(
                        "DELETE FROM kv_records WHERE store_name = ?1 AND record_key = ?2",
                        params![store, key],
                    )?;
                }
            }
            tx.commit()?;
            Ok(next)
        })
        .await
    }

    async fn count(&self, store: &str) -> Result<usize, StoreError> {
        let store = store.to_string();
        self.run("count records", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kv_records WHERE store_name = ?1",
                params![store],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
        .await
    }
}
