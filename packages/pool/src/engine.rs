//! The external bundler engine seam.
//!
//! The pool never implements bundling itself. It fetches the engine's host
//! script and WASM binary from a CDN and hands them to an [`EngineFactory`];
//! each worker instantiates its own [`Engine`] from the shared artifact
//! bytes during setup.

use std::time::Duration;

use bytes::Bytes;
use packbox_http::{get_with_timeout, HttpClient};
use packbox_vfs::Vfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Oldest engine version the pool drives. Older engines used different
/// artifact filenames and startup APIs and are not supported.
pub const MIN_ENGINE_VERSION: &str = "0.10.1";

pub const PRIMARY_CDN_BASE: &str = "https://cdn.jsdelivr.net/npm";
pub const FALLBACK_CDN_BASE: &str = "https://unpkg.com";
/// Deadline for the primary CDN before falling back.
pub const ARTIFACT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The engine bytes every worker in a generation shares.
#[derive(Debug, Clone)]
pub struct EngineArtifacts {
    pub version: String,
    pub host_js: String,
    pub wasm: Bytes,
}

/// A source location attached to a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
    #[serde(rename = "lineText", default, skip_serializing_if = "Option::is_none")]
    pub line_text: Option<String>,
}

/// One engine diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Message {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            location: None,
        }
    }
}

/// How an engine invocation fails.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine reported {} error(s)", errors.len())]
    Diagnostics {
        errors: Vec<Message>,
        warnings: Vec<Message>,
    },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("Engine setup failed: {0}")]
pub struct EngineSetupError(pub String);

/// Result of a single-file transform.
#[derive(Debug, Clone, Default)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
    pub mangle_cache: Option<Value>,
    pub legal_comments: Option<String>,
    pub warnings: Vec<Message>,
    /// Raw stderr stream emitted alongside structured diagnostics.
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub text: String,
}

/// Result of a project build.
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub output_files: Vec<OutputFile>,
    pub metafile: Option<Value>,
    pub mangle_cache: Option<Value>,
    pub warnings: Vec<Message>,
    pub stderr: String,
}

/// The bundler engine a worker hosts. One instance per worker; never shared.
#[async_trait::async_trait]
pub trait Engine: Send {
    /// Compile a single source text.
    ///
    /// # Errors
    ///
    /// * If the engine reports diagnostics or throws
    async fn transform(&mut self, code: &str, options: &Value)
        -> Result<TransformResult, EngineError>;

    /// Bundle the project currently on `fs`.
    ///
    /// # Errors
    ///
    /// * If the engine reports diagnostics or throws
    async fn build(&mut self, fs: &Vfs, options: &Value) -> Result<BuildResult, EngineError>;
}

/// Creates engine instances from fetched artifacts.
#[async_trait::async_trait]
pub trait EngineFactory: Send + Sync {
    /// # Errors
    ///
    /// * If the engine cannot be instantiated from the artifact bytes
    async fn create(&self, artifacts: &EngineArtifacts) -> Result<Box<dyn Engine>, EngineSetupError>;
}

#[derive(Debug, Error)]
pub enum LoadEngineError {
    #[error(transparent)]
    Http(#[from] packbox_http::Error),
    #[error("Engine host script is not valid UTF-8")]
    HostEncoding,
}

/// Fetch one artifact: primary CDN under a hard deadline, single fallback
/// CDN on any failure, no further retries.
///
/// # Errors
///
/// * If both CDNs fail
pub async fn fetch_cdn_artifact(
    http: &dyn HttpClient,
    subpath: &str,
) -> Result<Bytes, LoadEngineError> {
    let primary = format!("{PRIMARY_CDN_BASE}/{subpath}");
    match get_with_timeout(http, &primary, ARTIFACT_FETCH_TIMEOUT)
        .await
        .and_then(|response| response.ok_bytes(&primary))
    {
        Ok(data) => Ok(data),
        Err(e) => {
            log::debug!("Primary CDN failed for {subpath}, trying fallback: {e:?}");
            let fallback = format!("{FALLBACK_CDN_BASE}/{subpath}");
            Ok(get_with_timeout(http, &fallback, ARTIFACT_FETCH_TIMEOUT)
                .await?
                .ok_bytes(&fallback)?)
        }
    }
}

/// Fetch the engine's host script and WASM binary in parallel.
///
/// # Errors
///
/// * If either artifact cannot be fetched from both CDNs
pub async fn load_engine_artifacts(
    http: &dyn HttpClient,
    version: &str,
) -> Result<EngineArtifacts, LoadEngineError> {
    log::debug!("Loading engine artifacts for esbuild-wasm@{version}");

    let host_path = format!("esbuild-wasm@{version}/lib/browser.min.js");
    let wasm_path = format!("esbuild-wasm@{version}/esbuild.wasm");

    let (host_js, wasm) = futures::try_join!(
        fetch_cdn_artifact(http, &host_path),
        fetch_cdn_artifact(http, &wasm_path),
    )?;

    let host_js = String::from_utf8(host_js.to_vec()).map_err(|_| LoadEngineError::HostEncoding)?;

    Ok(EngineArtifacts {
        version: version.to_string(),
        host_js,
        wasm,
    })
}
