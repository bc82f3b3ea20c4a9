//! Preview store and fetch interception.
//!
//! A long-lived service owns the uploaded project files and serves them to
//! preview clients. Files live in a process-local map backed by a persistent
//! per-project cache, so a preview survives a restart of the in-memory
//! store. The HTTP surface lives in [`server`]; the interception rules here
//! are plain functions so they test without a listener.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub mod server;

/// URL prefix for path-based preview requests.
pub const PREVIEW_PATH_PREFIX: &str = "/__build/";
/// Environment variable supplying the host-suffix interception rule,
/// standing in for the build-time-substituted preview suffix.
pub const PREVIEW_SUFFIX_ENV: &str = "PACKBOX_PREVIEW_SUFFIX";
/// Persistent cache name prefix; one cache per project.
pub const CACHE_NAME_PREFIX: &str = "esbuild-files-";
/// Default document when a `/__build/` request omits the file path.
pub const DEFAULT_DOCUMENT: &str = "index.html";

/// Fixed header block attached to every served preview file.
pub const CROSS_ORIGIN_ISOLATION_HEADERS: [(&str, &str); 7] = [
    ("Cross-Origin-Embedder-Policy", "require-corp"),
    ("Cross-Origin-Opener-Policy", "same-origin"),
    ("Cross-Origin-Resource-Policy", "cross-origin"),
    (
        "Content-Security-Policy",
        "default-src * 'unsafe-inline' 'unsafe-eval' data: blob:",
    ),
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "ALLOWALL"),
    ("X-XSS-Protection", "1; mode=block"),
];

/// MIME type derived from a path's extension.
#[must_use]
pub fn mime_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("html") => "text/html",
        Some("json" | "map") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Error)]
pub enum OpenFileCacheError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistent per-project file cache, keyed by absolute URL.
#[derive(Clone)]
pub struct FileCache {
    conn: Arc<Mutex<Connection>>,
}

impl FileCache {
    /// # Errors
    ///
    /// * If the database cannot be opened or the schema created
    pub fn open(dir: &Path) -> Result<Self, OpenFileCacheError> {
        Self::init(Connection::open(dir.join("preview-files.db"))?)
    }

    /// # Errors
    ///
    /// * If the schema cannot be created
    pub fn open_in_memory() -> Result<Self, OpenFileCacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OpenFileCacheError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                cache TEXT NOT NULL,
                url TEXT NOT NULL,
                body BLOB,
                contentType TEXT,
                PRIMARY KEY (cache, url)
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn clear(&self, cache_name: &str) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute("DELETE FROM files WHERE cache = ?1", [cache_name]) {
            log::error!("Failed to clear cache {cache_name}: {e:?}");
        }
    }

    fn put(&self, cache_name: &str, url: &str, body: &[u8], content_type: &str) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO files (cache, url, body, contentType) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![cache_name, url, body, content_type],
        ) {
            log::error!("Failed to cache {url} in {cache_name}: {e:?}");
        }
    }

    /// Every `(url, body)` entry for a project cache.
    fn entries(&self, cache_name: &str) -> Vec<(String, Vec<u8>)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare("SELECT url, body FROM files WHERE cache = ?1") {
            Ok(stmt) => stmt,
            Err(e) => {
                log::error!("Failed to query cache {cache_name}: {e:?}");
                return vec![];
            }
        };

        stmt.query_map([cache_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
    }
}

/// The preview suffix from the environment, when populated.
#[must_use]
pub fn preview_suffix_from_env() -> Option<String> {
    std::env::var(PREVIEW_SUFFIX_ENV)
        .ok()
        .filter(|x| !x.is_empty())
}

#[must_use]
pub fn cache_name(project_id: &str) -> String {
    format!("{CACHE_NAME_PREFIX}{project_id}")
}

fn cache_url(project_id: &str, path: &str) -> String {
    format!("{PREVIEW_PATH_PREFIX}{project_id}/{path}")
}

/// The preview store: one file map per project, plus the persistent cache
/// and the optional host-suffix interception rule.
pub struct PreviewContext {
    files: HashMap<String, HashMap<String, Bytes>>,
    cache: FileCache,
    preview_suffix: Option<String>,
}

impl PreviewContext {
    #[must_use]
    pub fn new(cache: FileCache, preview_suffix: Option<String>) -> Self {
        Self {
            files: HashMap::new(),
            cache,
            preview_suffix,
        }
    }
}

/// Commands the preview service processes.
pub enum Command {
    UploadFiles {
        project_id: String,
        files: BTreeMap<String, Bytes>,
        tx: Option<flume::Sender<UploadComplete>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadComplete {
    pub project_id: String,
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Failed to send command to preview service")]
    Send,
    #[error(transparent)]
    Recv(#[from] flume::RecvError),
}

/// Cloneable handle for the preview service.
#[derive(Clone)]
pub struct PreviewHandle {
    sender: flume::Sender<Command>,
    token: CancellationToken,
    ctx: Arc<RwLock<PreviewContext>>,
}

impl PreviewHandle {
    /// Upload a project's files and await the completion reply. Replaces the
    /// project's previous upload entirely.
    ///
    /// # Errors
    ///
    /// * If the service has shut down
    pub async fn upload_files(
        &self,
        project_id: impl Into<String>,
        files: BTreeMap<String, Bytes>,
    ) -> Result<UploadComplete, PreviewError> {
        let (tx, rx) = flume::bounded(1);
        self.sender
            .send_async(Command::UploadFiles {
                project_id: project_id.into(),
                files,
                tx: Some(tx),
            })
            .await
            .map_err(|_| PreviewError::Send)?;
        Ok(rx.recv_async().await?)
    }

    #[must_use]
    pub fn context(&self) -> Arc<RwLock<PreviewContext>> {
        self.ctx.clone()
    }

    pub fn shutdown(&self) {
        log::debug!("Shutting down preview service");
        self.token.cancel();
    }
}

/// The preview service. Owns the store; commands are processed sequentially.
pub struct PreviewService {
    ctx: Arc<RwLock<PreviewContext>>,
    sender: flume::Sender<Command>,
    receiver: flume::Receiver<Command>,
    token: CancellationToken,
}

impl PreviewService {
    #[must_use]
    pub fn new(ctx: PreviewContext) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            ctx: Arc::new(RwLock::new(ctx)),
            sender: tx,
            receiver: rx,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> PreviewHandle {
        PreviewHandle {
            sender: self.sender.clone(),
            token: self.token.clone(),
            ctx: self.ctx.clone(),
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    () = self.token.cancelled() => {
                        log::debug!("Preview service cancelled");
                        break;
                    }
                    command = self.receiver.recv_async() => command,
                };

                let Ok(command) = command else {
                    break;
                };

                Self::process_command(&self.ctx, command).await;
            }

            log::debug!("Preview service stopped");
        })
    }

    async fn process_command(ctx: &Arc<RwLock<PreviewContext>>, command: Command) {
        match command {
            Command::UploadFiles {
                project_id,
                files,
                tx,
            } => {
                log::debug!(
                    "Uploading {count} file(s) for project {project_id}",
                    count = files.len()
                );

                let mut ctx = ctx.write().await;
                let name = cache_name(&project_id);

                ctx.cache.clear(&name);
                let mut project = HashMap::new();
                for (path, body) in files {
                    let path = path.trim_start_matches('/').to_string();
                    ctx.cache
                        .put(&name, &cache_url(&project_id, &path), &body, mime_type(&path));
                    project.insert(path, body);
                }
                ctx.files.insert(project_id.clone(), project);
                drop(ctx);

                if let Some(tx) = tx {
                    if let Err(e) = tx.send_async(UploadComplete { project_id }).await {
                        log::debug!("Upload reply receiver gone: {e:?}");
                    }
                }
            }
        }
    }
}

/// A response produced by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intercepted {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl Intercepted {
    fn ok(path: &str, body: Bytes) -> Self {
        Self {
            status: 200,
            content_type: mime_type(path).to_string(),
            body,
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: Bytes::from_static(b"File not found"),
        }
    }
}

/// Apply the interception rules to a request. Returns `None` when the
/// request is not a preview request at all.
///
/// Rule 1: a configured preview suffix matches the request host; the project
/// id is the host prefix, the file path is the URL path as-is, and only the
/// in-memory store is consulted.
/// Rule 2: the URL path starts with `/__build/`; the file path defaults to
/// `index.html`, and a memory miss falls back to the persistent cache,
/// repopulating the in-memory map on a hit.
pub async fn intercept(
    ctx: &Arc<RwLock<PreviewContext>>,
    host: &str,
    path: &str,
) -> Option<Intercepted> {
    let host = host.split(':').next().unwrap_or(host);

    {
        let ctx_read = ctx.read().await;
        if let Some(suffix) = &ctx_read.preview_suffix {
            if let Some(prefix) = host.strip_suffix(suffix.as_str()) {
                let project_id = prefix.trim_end_matches('.').to_string();
                let file_path = path.trim_start_matches('/').to_string();

                let body = ctx_read
                    .files
                    .get(&project_id)
                    .and_then(|project| project.get(&file_path))
                    .cloned();

                return Some(body.map_or_else(Intercepted::not_found, |body| {
                    Intercepted::ok(&file_path, body)
                }));
            }
        }
    }

    let rest = path.strip_prefix(PREVIEW_PATH_PREFIX)?;
    let (project_id, file_path) = match rest.split_once('/') {
        Some((project_id, file_path)) if !file_path.is_empty() => {
            (project_id.to_string(), file_path.to_string())
        }
        Some((project_id, _)) => (project_id.to_string(), DEFAULT_DOCUMENT.to_string()),
        None => (rest.to_string(), DEFAULT_DOCUMENT.to_string()),
    };

    {
        let ctx_read = ctx.read().await;
        if let Some(body) = ctx_read
            .files
            .get(&project_id)
            .and_then(|project| project.get(&file_path))
        {
            return Some(Intercepted::ok(&file_path, body.clone()));
        }
    }

    // Memory miss: repopulate the project from the persistent cache.
    let mut ctx_write = ctx.write().await;
    let name = cache_name(&project_id);
    let entries = ctx_write.cache.entries(&name);

    if entries.is_empty() {
        return Some(Intercepted::not_found());
    }

    log::debug!(
        "Repopulating project {project_id} from persistent cache ({count} file(s))",
        count = entries.len()
    );

    let url_prefix = cache_url(&project_id, "");
    let project = ctx_write.files.entry(project_id.clone()).or_default();
    for (url, body) in entries {
        if let Some(file) = url.strip_prefix(&url_prefix) {
            project.insert(file.to_string(), Bytes::from(body));
        }
    }

    let body = project.get(&file_path).cloned();
    drop(ctx_write);

    Some(body.map_or_else(Intercepted::not_found, |body| {
        Intercepted::ok(&file_path, body)
    }))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn new_service(suffix: Option<&str>) -> (PreviewHandle, tokio::task::JoinHandle<()>) {
        let cache = FileCache::open_in_memory().unwrap();
        let service = PreviewService::new(PreviewContext::new(
            cache,
            suffix.map(ToString::to_string),
        ));
        let handle = service.handle();
        let join = service.start();
        (handle, join)
    }

    fn files(entries: &[(&str, &[u8])]) -> BTreeMap<String, Bytes> {
        entries
            .iter()
            .map(|(path, body)| ((*path).to_string(), Bytes::from(body.to_vec())))
            .collect()
    }

    #[test_log::test]
    fn mime_map_covers_the_known_extensions() {
        assert_eq!(mime_type("a.js"), "application/javascript");
        assert_eq!(mime_type("a.css"), "text/css");
        assert_eq!(mime_type("a.html"), "text/html");
        assert_eq!(mime_type("a.json"), "application/json");
        assert_eq!(mime_type("a.js.map"), "application/json");
        assert_eq!(mime_type("a.txt"), "text/plain");
        assert_eq!(mime_type("a.png"), "image/png");
        assert_eq!(mime_type("a.jpeg"), "image/jpeg");
        assert_eq!(mime_type("a.svg"), "image/svg+xml");
        assert_eq!(mime_type("a.wasm"), "application/octet-stream");
        assert_eq!(mime_type("no-extension"), "application/octet-stream");
    }

    #[test_log::test(tokio::test)]
    async fn upload_then_build_path_serves_from_memory() {
        let (handle, join) = new_service(None);

        let complete = handle
            .upload_files("proj1", files(&[("index.html", b"<html/>"), ("app.js", b"js")]))
            .await
            .unwrap();
        assert_eq!(complete.project_id, "proj1");

        let ctx = handle.context();

        let response = intercept(&ctx, "localhost", "/__build/proj1/app.js")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "application/javascript");
        assert_eq!(&response.body[..], b"js");

        // Default document.
        let response = intercept(&ctx, "localhost", "/__build/proj1")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"<html/>");

        handle.shutdown();
        join.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn non_preview_requests_are_not_intercepted() {
        let (handle, join) = new_service(None);
        let ctx = handle.context();

        assert_eq!(intercept(&ctx, "localhost", "/api/health").await, None);

        handle.shutdown();
        join.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn missing_file_returns_textual_404() {
        let (handle, join) = new_service(None);
        handle
            .upload_files("proj1", files(&[("index.html", b"<html/>")]))
            .await
            .unwrap();

        let ctx = handle.context();
        let response = intercept(&ctx, "localhost", "/__build/proj1/missing.js")
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(&response.body[..], b"File not found");

        handle.shutdown();
        join.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn persistent_cache_survives_a_store_restart() {
        let cache = FileCache::open_in_memory().unwrap();

        let service = PreviewService::new(PreviewContext::new(cache.clone(), None));
        let handle = service.handle();
        let join = service.start();
        handle
            .upload_files("proj1", files(&[("app.js", b"cached")]))
            .await
            .unwrap();
        handle.shutdown();
        join.await.unwrap();

        // Fresh in-memory store, same persistent cache.
        let service = PreviewService::new(PreviewContext::new(cache, None));
        let handle = service.handle();
        let join = service.start();
        let ctx = handle.context();

        let response = intercept(&ctx, "localhost", "/__build/proj1/app.js")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"cached");

        // The miss repopulated the in-memory map.
        assert!(ctx.read().await.files.contains_key("proj1"));

        handle.shutdown();
        join.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn re_upload_replaces_the_persistent_cache() {
        let cache = FileCache::open_in_memory().unwrap();
        let service = PreviewService::new(PreviewContext::new(cache.clone(), None));
        let handle = service.handle();
        let join = service.start();

        handle
            .upload_files("proj1", files(&[("old.js", b"old")]))
            .await
            .unwrap();
        handle
            .upload_files("proj1", files(&[("new.js", b"new")]))
            .await
            .unwrap();

        let entries = cache.entries(&cache_name("proj1"));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.ends_with("new.js"));

        handle.shutdown();
        join.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn host_suffix_rule_serves_from_memory_only() {
        let (handle, join) = new_service(Some("preview.test"));
        handle
            .upload_files("proj1", files(&[("index.html", b"<html/>")]))
            .await
            .unwrap();

        let ctx = handle.context();

        let response = intercept(&ctx, "proj1.preview.test", "/index.html")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"<html/>");

        // The file path is the URL path as-is; a bare root request has no
        // stored entry and is a 404, unlike the `/__build/` rule.
        let response = intercept(&ctx, "proj1.preview.test", "/")
            .await
            .unwrap();
        assert_eq!(response.status, 404);

        let response = intercept(&ctx, "unknown.preview.test", "/index.html")
            .await
            .unwrap();
        assert_eq!(response.status, 404);

        handle.shutdown();
        join.await.unwrap();
    }
}
