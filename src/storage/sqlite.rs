//! SQLite-backed object store for single-node deployments.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use super::{schema, ObjectStore, ObjectSummary, StoredObject, Tags};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

#[derive(Clone)]
pub struct SqliteObjectStore {
    pool: Pool,
}

impl SqliteObjectStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    /// Run a blocking closure against a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .context("sqlite worker panicked")?
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectSummary>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, length(body), last_modified FROM objects
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![prefix, max_keys as i64], |row| {
                Ok(ObjectSummary {
                    key: row.get(0)?,
                    size: row.get::<_, i64>(1)? as u64,
                    last_modified: parse_time(&row.get::<_, String>(2)?)?,
                })
            })?;
            let mut list = Vec::new();
            for r in rows {
                list.push(r?);
            }
            Ok(list)
        })
        .await
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT body, tags_json, last_modified FROM objects WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((body, tags_json, last_modified)) = row else {
                return Ok(None);
            };
            let tags: Tags = serde_json::from_str(&tags_json)
                .with_context(|| format!("corrupt tags for object {}", key))?;
            Ok(Some(StoredObject {
                key,
                body: Bytes::from(body),
                tags,
                last_modified: parse_time(&last_modified)?,
            }))
        })
        .await
    }

    async fn put_object(&self, key: &str, body: Bytes, tags: &Tags) -> Result<DateTime<Utc>> {
        let key = key.to_string();
        let tags_json = serde_json::to_string(tags)?;
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO objects (key, body, tags_json, last_modified) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET body = excluded.body,
                     tags_json = excluded.tags_json, last_modified = excluded.last_modified",
                params![key, body.as_ref(), tags_json, now.to_rfc3339()],
            )
            .with_context(|| format!("failed to write object {}", key))?;
            Ok(now)
        })
        .await
    }

    async fn put_tags(&self, key: &str, tags: &Tags) -> Result<()> {
        let key = key.to_string();
        let tags_json = serde_json::to_string(tags)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE objects SET tags_json = ?2 WHERE key = ?1",
                params![key, tags_json],
            )?;
            if changed == 0 {
                anyhow::bail!("object {} not found", key);
            }
            Ok(())
        })
        .await
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM objects WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}
