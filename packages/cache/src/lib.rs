//! Two-tier package cache.
//!
//! Both tiers memoise registry responses keyed by request path. The local
//! tier is a process-local map; the persistent tier is a `SQLite` database
//! that survives restarts. A transform failure over cached data is treated
//! as a miss and triggers a live refetch, never a hard failure.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    collections::HashMap,
    future::Future,
    path::Path,
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use rusqlite::Connection;
use thiserror::Error;

/// Name of the persistent cache database.
pub const DATABASE_NAME: &str = "ESBUILD-dependencies-cache";
/// Schema version recorded in `PRAGMA user_version`.
pub const DATABASE_VERSION: i32 = 1;

/// Process-local cache tier.
#[derive(Default)]
pub struct LocalCache {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl LocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `transform(cached)` on hit, otherwise fetches, stores the raw
    /// data, and transforms it. A failing transform over cached data falls
    /// through to a live fetch.
    ///
    /// # Errors
    ///
    /// * If the live fetch fails
    /// * If the transform fails over freshly fetched data
    pub async fn with_local_cache_data<T, E, Fut>(
        &self,
        request: &str,
        fetch: impl FnOnce() -> Fut,
        transform: impl Fn(&Bytes) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::fmt::Debug,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let cached = self.entries.read().unwrap().get(request).cloned();

        if let Some(data) = cached {
            match transform(&data) {
                Ok(value) => {
                    log::trace!("Local cache hit for {request}");
                    return Ok(value);
                }
                Err(e) => {
                    log::error!("Corrupted local cache entry for {request}, refetching: {e:?}");
                    self.entries.write().unwrap().remove(request);
                }
            }
        }

        let data = fetch().await?;
        self.entries
            .write()
            .unwrap()
            .insert(request.to_string(), data.clone());
        transform(&data)
    }

    /// Seed an entry directly. Used to pre-warm from a lockfile.
    pub fn insert(&self, request: impl Into<String>, data: impl Into<Bytes>) {
        self.entries
            .write()
            .unwrap()
            .insert(request.into(), data.into());
    }

    #[must_use]
    pub fn contains(&self, request: &str) -> bool {
        self.entries.read().unwrap().contains_key(request)
    }
}

#[derive(Debug, Error)]
pub enum OpenCacheError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistent cache tier backed by `SQLite`.
///
/// Schema version 1: `cache` (keyed by `name`, secondary index on
/// `lastUsed`), `lockfile` (keyed by `name`), `sandpack-cdn` (keyed by
/// `request`). Registry responses go to `sandpack-cdn`.
#[derive(Clone)]
pub struct PersistentCache {
    conn: Arc<Mutex<Connection>>,
}

impl PersistentCache {
    /// Open (or create) the cache database under `dir`.
    ///
    /// # Errors
    ///
    /// * If the database cannot be opened or the schema cannot be created
    pub fn open(dir: &Path) -> Result<Self, OpenCacheError> {
        let conn = Connection::open(dir.join(format!("{DATABASE_NAME}.db")))?;
        Self::init(conn)
    }

    /// Open an in-memory database. Used by tests and the simulator profile.
    ///
    /// # Errors
    ///
    /// * If the schema cannot be created
    pub fn open_in_memory() -> Result<Self, OpenCacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OpenCacheError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache (
                name TEXT PRIMARY KEY,
                data BLOB,
                lastUsed INTEGER
            );
            CREATE INDEX IF NOT EXISTS cache_lastUsed ON cache(lastUsed);
            CREATE TABLE IF NOT EXISTS lockfile (
                name TEXT PRIMARY KEY,
                data BLOB
            );
            CREATE TABLE IF NOT EXISTS \"sandpack-cdn\" (
                request TEXT PRIMARY KEY,
                data BLOB
            );
            ",
        )?;
        conn.pragma_update(None, "user_version", DATABASE_VERSION)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn read(&self, request: &str) -> Option<Vec<u8>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT data FROM \"sandpack-cdn\" WHERE request = ?1",
            [request],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .map_err(|e| {
            if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                log::error!("Failed to read cache entry for {request}: {e:?}");
            }
        })
        .ok()
    }

    fn write(&self, request: &str, data: &[u8]) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO \"sandpack-cdn\" (request, data) VALUES (?1, ?2)",
            rusqlite::params![request, data],
        ) {
            log::error!("Failed to persist cache entry for {request}: {e:?}");
        }
    }

    /// True iff a record with non-empty data exists for `request`.
    #[must_use]
    pub fn is_cached(&self, request: &str) -> bool {
        self.read(request).is_some_and(|data| !data.is_empty())
    }

    /// Returns `transform(cached)` on hit, otherwise fetches, persists, and
    /// transforms. Database failures and corrupted entries degrade to a live
    /// fetch.
    ///
    /// # Errors
    ///
    /// * If the live fetch fails
    /// * If the transform fails over freshly fetched data
    pub async fn with_cache_data<T, E, Fut>(
        &self,
        request: &str,
        fetch: impl FnOnce() -> Fut,
        transform: impl Fn(&Bytes) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::fmt::Debug,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        if let Some(data) = self.read(request) {
            let data = Bytes::from(data);
            match transform(&data) {
                Ok(value) => {
                    log::trace!("Persistent cache hit for {request}");
                    return Ok(value);
                }
                Err(e) => {
                    log::error!("Corrupted cache entry for {request}, refetching: {e:?}");
                }
            }
        }

        let data = fetch().await?;
        self.write(request, &data);
        transform(&data)
    }

    /// Bump the `lastUsed` stamp for an entry in the `cache` store.
    pub fn touch(&self, name: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|x| i64::try_from(x.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();

        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO cache (name, data, lastUsed) VALUES (?1, NULL, ?2)
             ON CONFLICT(name) DO UPDATE SET lastUsed = ?2",
            rusqlite::params![name, now],
        ) {
            log::error!("Failed to touch cache entry {name}: {e:?}");
        }
    }
}
