//! Public façade over the packbox subsystems.
//!
//! [`init`] fetches the engine artifacts, warms up the worker pool, and
//! returns a [`Packbox`] exposing the three user-facing operations:
//! single-file transform, multi-file bundle, and npm install. All three
//! execute on background workers against virtual file system snapshots.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use packbox_cache::{LocalCache, OpenCacheError, PersistentCache};
use packbox_http::HttpClient;
use packbox_installer::{NpmInstaller, ProgressSender};
use packbox_pool::{
    EngineFactory, Pool, PoolBootstrapError, PoolOptions, SubmitError, WorkerRequest,
};
use packbox_vfs::{FileRecord, Vfs};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

/// Environment override for the registry base URL.
pub const REGISTRY_URL_ENV: &str = "PACKBOX_REGISTRY_URL";
/// Environment override for the persistent cache directory.
pub const CACHE_DIR_ENV: &str = "PACKBOX_CACHE_DIR";

fn env_or(name: &str, default: Option<String>) -> Option<String> {
    std::env::var(name).ok().filter(|x| !x.is_empty()).or(default)
}

/// Options for [`init`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub esbuild_version: String,
    pub registry_base_url: Option<String>,
    pub min_concurrency: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub queue_timeout: Option<Duration>,
    pub cache_dir: Option<PathBuf>,
}

impl InitOptions {
    #[must_use]
    pub fn new(esbuild_version: impl Into<String>) -> Self {
        Self {
            esbuild_version: esbuild_version.into(),
            registry_base_url: None,
            min_concurrency: None,
            max_concurrency: None,
            queue_timeout: None,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Pool(#[from] PoolBootstrapError),
    #[error(transparent)]
    OpenCache(#[from] OpenCacheError),
}

#[derive(Debug, Error)]
pub enum NpmInstallError {
    #[error("No registry base URL configured")]
    MissingRegistryUrl,
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Payload(#[from] serde_json::Error),
}

/// Reply payload of a transform. A transform that failed with engine
/// diagnostics carries only `stderr` and the JSON `stdout`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub mangle_cache: Option<Value>,
    #[serde(default)]
    pub legal_comments: Option<String>,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub text: String,
}

/// Reply payload of a bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    #[serde(default)]
    pub metafile: Option<Value>,
    #[serde(default)]
    pub mangle_cache: Option<Value>,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Options for [`Packbox::npm_install`].
#[derive(Default)]
pub struct NpmInstallOptions {
    pub registry_base_url: Option<String>,
    pub cwd: Option<String>,
    /// Snapshot to install against; defaults to the shared FS contents.
    pub raw_files: Option<BTreeMap<String, FileRecord>>,
    pub progress: Option<ProgressSender>,
}

/// Options for [`Packbox::bundle`].
#[derive(Default)]
pub struct BundleOptions {
    /// Snapshot to bundle; defaults to the shared FS contents.
    pub raw_files: Option<BTreeMap<String, FileRecord>>,
}

/// Engine defaults applied beneath caller options on every bundle.
#[must_use]
pub fn default_engine_options() -> Value {
    json!({
        "target": "chrome67",
        "format": "esm",
        "splitting": true,
        "bundle": true,
        "sourcemap": true,
        "minify": false,
        "loader": {
            ".js": "jsx",
            ".jsx": "jsx",
            ".ts": "tsx",
            ".tsx": "tsx",
            ".css": "css",
            ".json": "json",
            ".png": "dataurl",
            ".jpg": "dataurl",
            ".jpeg": "dataurl",
            ".gif": "dataurl",
            ".svg": "dataurl",
        },
    })
}

fn merge_engine_options(overrides: &Value) -> Value {
    let mut merged = default_engine_options();

    if let (Some(merged), Some(overrides)) = (merged.as_object_mut(), overrides.as_object()) {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

/// The initialised system: shared FS, worker pool, installer.
pub struct Packbox {
    fs: Arc<RwLock<Vfs>>,
    pool: Pool,
    installer: NpmInstaller,
    registry_base_url: Option<String>,
}

/// Fetch engine artifacts and warm up the pool.
///
/// # Errors
///
/// * If the persistent cache cannot be opened
/// * If pool bootstrap fails (artifact fetch or worker setup)
pub async fn init(
    options: InitOptions,
    http: Arc<dyn HttpClient>,
    factory: Arc<dyn EngineFactory>,
) -> Result<Packbox, InitError> {
    let cache_dir = env_or(CACHE_DIR_ENV, None)
        .map(PathBuf::from)
        .or(options.cache_dir);
    let persistent_cache = match &cache_dir {
        Some(dir) => PersistentCache::open(dir)?,
        None => PersistentCache::open_in_memory()?,
    };

    let installer = NpmInstaller::new(
        http.clone(),
        Arc::new(LocalCache::new()),
        persistent_cache,
    );

    let fs = Arc::new(RwLock::new(Vfs::new()));

    let mut pool_options = PoolOptions::new(options.esbuild_version);
    pool_options.min_concurrency = options.min_concurrency;
    pool_options.max_concurrency = options.max_concurrency;
    if let Some(queue_timeout) = options.queue_timeout {
        pool_options.queue_timeout = queue_timeout;
    }

    let pool = Pool::new(
        pool_options,
        http,
        factory,
        installer.clone(),
        fs.clone(),
    )
    .await?;

    log::debug!(
        "packbox initialised: {size} worker(s), engine {version}",
        size = pool.size(),
        version = pool.version()
    );

    Ok(Packbox {
        fs,
        pool,
        installer,
        registry_base_url: env_or(REGISTRY_URL_ENV, options.registry_base_url),
    })
}

impl Packbox {
    /// The shared project file system. Snapshots passed into `bundle` and
    /// `npm_install` are taken from here unless the caller supplies one.
    #[must_use]
    pub fn fs(&self) -> Arc<RwLock<Vfs>> {
        self.fs.clone()
    }

    /// The installer, for `package_script`/`dependency_scripts` lookups.
    #[must_use]
    pub const fn installer(&self) -> &NpmInstaller {
        &self.installer
    }

    /// Resolve and install the project's dependency tree on a worker, then
    /// flush the resulting files back into the shared FS.
    ///
    /// # Errors
    ///
    /// * If no registry base URL is configured
    /// * If the worker rejects the install
    pub async fn npm_install(&self, options: NpmInstallOptions) -> Result<(), NpmInstallError> {
        let registry_base_url = options
            .registry_base_url
            .or_else(|| self.registry_base_url.clone())
            .ok_or(NpmInstallError::MissingRegistryUrl)?;

        let files = match options.raw_files {
            Some(files) => files,
            None => self.fs.read().await.raw_files(),
        };

        self.pool
            .submit(
                WorkerRequest::NpmInstall {
                    registry_base_url,
                    files,
                    cwd: options.cwd,
                },
                options.progress,
            )
            .await?;

        Ok(())
    }

    /// Bundle a project snapshot with the default engine options beneath
    /// `engine_options`.
    ///
    /// # Errors
    ///
    /// * If the worker rejects the task or the reply payload is malformed
    pub async fn bundle(
        &self,
        engine_options: &Value,
        options: BundleOptions,
    ) -> Result<BuildResponse, BundleError> {
        let files = match options.raw_files {
            Some(files) => files,
            None => self.fs.read().await.raw_files(),
        };

        let value = self
            .pool
            .submit(
                WorkerRequest::Build {
                    options: merge_engine_options(engine_options),
                    files,
                },
                None,
            )
            .await?;

        Ok(serde_json::from_value(value)?)
    }

    /// Compile a single source text.
    ///
    /// # Errors
    ///
    /// * If the worker rejects the task or the reply payload is malformed
    pub async fn transform(
        &self,
        code: impl Into<String>,
        options: Value,
    ) -> Result<TransformResponse, BundleError> {
        let value = self
            .pool
            .submit(
                WorkerRequest::Transform {
                    code: code.into(),
                    options,
                },
                None,
            )
            .await?;

        Ok(serde_json::from_value(value)?)
    }

    /// Swap the engine version at runtime. Outstanding tasks are rejected
    /// with a reload reason.
    ///
    /// # Errors
    ///
    /// * If the new pool fails to bootstrap
    pub async fn reload(&self, esbuild_version: &str) -> Result<(), PoolBootstrapError> {
        self.pool.reload(esbuild_version).await
    }

    /// Tear down the pool.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
