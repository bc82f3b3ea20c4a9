//! The background executor.
//!
//! Each worker owns a private engine instance and a private FS; neither is
//! shared across workers. Requests arrive as `(id, request)` frames and
//! every reply carries the id back so the router can correlate it.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use flume::{Receiver, Sender};
use packbox_installer::{InstallOptions, NpmInstaller, ProgressEvent};
use packbox_vfs::{FileRecord, Vfs};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::AsRefStr;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Engine, EngineArtifacts, EngineError, EngineFactory, EngineSetupError, Message},
    fmt::{self, MessageKind},
};

/// Output directory the engine writes bundles to. Stripped from every output
/// path before the reply is sent.
pub const BUILD_OUTDIR: &str = "/dist/";

/// A request the pool accepts.
#[derive(Debug, Clone, Serialize, Deserialize, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerRequest {
    Transform {
        code: String,
        options: Value,
    },
    Build {
        options: Value,
        files: BTreeMap<String, FileRecord>,
    },
    NpmInstall {
        registry_base_url: String,
        files: BTreeMap<String, FileRecord>,
        cwd: Option<String>,
    },
}

/// A frame a worker posts back. `Resolve` and `Reject` are terminal;
/// `Progress` is not.
#[derive(Debug, Clone)]
pub enum WorkerReply {
    Resolve(Value),
    Reject(String),
    Progress(ProgressEvent),
}

pub(crate) type TaskFrame = (String, WorkerRequest);
pub(crate) type ReplyFrame = (String, WorkerReply);

struct WorkerContext {
    index: usize,
    engine: Box<dyn Engine>,
    fs: Vfs,
    shared_fs: Arc<RwLock<Vfs>>,
    installer: NpmInstaller,
    reply_tx: Sender<ReplyFrame>,
}

/// Instantiate a worker's engine and start its request loop.
///
/// The setup handshake completes before the worker is admitted: a factory
/// failure is reported here and the worker never enters the pool.
///
/// # Errors
///
/// * If the engine factory fails to create an instance from the artifacts
pub(crate) async fn spawn_worker(
    index: usize,
    factory: Arc<dyn EngineFactory>,
    artifacts: Arc<EngineArtifacts>,
    installer: NpmInstaller,
    shared_fs: Arc<RwLock<Vfs>>,
    rx: Receiver<TaskFrame>,
    reply_tx: Sender<ReplyFrame>,
    token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, EngineSetupError> {
    let engine = factory.create(&artifacts).await?;
    log::debug!(
        "Worker {index} setup succeeded for engine {version}",
        version = artifacts.version
    );

    let mut ctx = WorkerContext {
        index,
        engine,
        fs: Vfs::new(),
        shared_fs,
        installer,
        reply_tx,
    };

    Ok(tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => break,
                frame = rx.recv_async() => frame,
            };

            let Ok((id, request)) = frame else {
                break;
            };

            log::trace!(
                "Worker {index} handling {request} id={id}",
                index = ctx.index,
                request = request.as_ref()
            );

            let reply = handle_request(&mut ctx, &id, request).await;

            if ctx.reply_tx.send_async((id, reply)).await.is_err() {
                break;
            }
        }

        log::debug!("Worker {index} stopped", index = ctx.index);
    }))
}

async fn handle_request(ctx: &mut WorkerContext, id: &str, request: WorkerRequest) -> WorkerReply {
    match request {
        WorkerRequest::Transform { code, options } => handle_transform(ctx, &code, &options).await,
        WorkerRequest::Build { options, files } => handle_build(ctx, options, files).await,
        WorkerRequest::NpmInstall {
            registry_base_url,
            files,
            cwd,
        } => handle_npm_install(ctx, id, registry_base_url, files, cwd).await,
    }
}

async fn handle_transform(ctx: &mut WorkerContext, code: &str, options: &Value) -> WorkerReply {
    let start = Instant::now();
    ctx.fs.reset();

    match ctx.engine.transform(code, options).await {
        Ok(result) => {
            let formatted = fmt::format_messages(MessageKind::Warning, &result.warnings);
            let stderr = fmt::merge_stderr(&formatted, &result.stderr);

            WorkerReply::Resolve(json!({
                "code": result.code,
                "map": result.map,
                "mangleCache": result.mangle_cache,
                "legalComments": result.legal_comments,
                "stderr": stderr,
                "duration": duration_millis(start),
            }))
        }
        Err(e) => engine_failure_reply(&e),
    }
}

async fn handle_build(
    ctx: &mut WorkerContext,
    mut options: Value,
    files: BTreeMap<String, FileRecord>,
) -> WorkerReply {
    let start = Instant::now();
    ctx.fs.reset_to(files);

    if let Some(map) = options.as_object_mut() {
        map.insert("outdir".to_string(), Value::String(BUILD_OUTDIR.to_string()));
    }

    match ctx.engine.build(&ctx.fs, &options).await {
        Ok(result) => {
            let output_files = result
                .output_files
                .into_iter()
                .map(|mut file| {
                    file.path = strip_outdir(&file.path).to_string();
                    file
                })
                .collect::<Vec<_>>();

            let formatted = fmt::format_messages(MessageKind::Warning, &result.warnings);
            let stderr = fmt::merge_stderr(&formatted, &result.stderr);

            WorkerReply::Resolve(json!({
                "outputFiles": output_files,
                "metafile": result.metafile,
                "mangleCache": result.mangle_cache,
                "duration": duration_millis(start),
                "stderr": stderr,
            }))
        }
        Err(e) => engine_failure_reply(&e),
    }
}

async fn handle_npm_install(
    ctx: &mut WorkerContext,
    id: &str,
    registry_base_url: String,
    files: BTreeMap<String, FileRecord>,
    cwd: Option<String>,
) -> WorkerReply {
    let mut fs = Vfs::new();
    fs.set_files(files);
    if let Some(cwd) = cwd {
        fs.chdir(&cwd);
    }
    let fs = Arc::new(RwLock::new(fs));

    let (progress_tx, progress_rx) = flume::unbounded::<ProgressEvent>();
    let forwarder = {
        let reply_tx = ctx.reply_tx.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            while let Ok(event) = progress_rx.recv_async().await {
                if reply_tx
                    .send_async((id.clone(), WorkerReply::Progress(event)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    let result = {
        let options = InstallOptions {
            registry_base_url,
            dependencies: BTreeMap::new(),
            progress: Some(progress_tx),
        };
        ctx.installer.install(&fs, &options).await
    };

    // All progress frames precede the terminal reply.
    if let Err(e) = forwarder.await {
        log::error!("Progress forwarder failed: {e:?}");
    }

    match result {
        Ok(()) => {
            let raw_files = fs.read().await.raw_files();
            ctx.shared_fs.write().await.set_files(raw_files);
            WorkerReply::Resolve(Value::Null)
        }
        Err(e) => WorkerReply::Reject(e.to_string()),
    }
}

/// Engine-level diagnostics come back as a successful reply carrying stderr
/// text plus a JSON stdout. Protocol-level rejects are reserved for harness
/// failures.
fn engine_failure_reply(error: &EngineError) -> WorkerReply {
    let (errors, warnings) = match error {
        EngineError::Diagnostics { errors, warnings } => (errors.clone(), warnings.clone()),
        EngineError::Other(text) => (vec![Message::text(text.clone())], vec![]),
    };

    let mut formatted = fmt::format_messages(MessageKind::Error, &errors);
    formatted.extend(fmt::format_messages(MessageKind::Warning, &warnings));
    let stderr = fmt::merge_stderr(&formatted, "");

    let stdout = serde_json::to_string(&json!({
        "errors": errors,
        "warnings": warnings,
    }))
    .unwrap_or_else(|_| "{}".to_string());

    WorkerReply::Resolve(json!({
        "stderr": stderr,
        "stdout": stdout,
    }))
}

fn strip_outdir(path: &str) -> &str {
    path.strip_prefix(BUILD_OUTDIR)
        .or_else(|| path.strip_prefix(BUILD_OUTDIR.trim_start_matches('/')))
        .unwrap_or(path)
}

#[allow(clippy::cast_possible_truncation)]
fn duration_millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn strip_outdir_handles_both_prefix_shapes() {
        assert_eq!(strip_outdir("/dist/index.js"), "index.js");
        assert_eq!(strip_outdir("dist/index.js"), "index.js");
        assert_eq!(strip_outdir("other/index.js"), "other/index.js");
    }

    #[test_log::test]
    fn engine_failure_reply_is_a_resolve_with_diagnostic_payload() {
        let reply = engine_failure_reply(&EngineError::Other("boom".to_string()));

        let WorkerReply::Resolve(payload) = reply else {
            panic!("expected a resolve reply");
        };

        assert!(!payload["stderr"].as_str().unwrap().is_empty());

        let stdout: Value =
            serde_json::from_str(payload["stdout"].as_str().unwrap()).unwrap();
        assert_eq!(stdout["errors"][0]["text"], "boom");
        assert_eq!(stdout["warnings"].as_array().unwrap().len(), 0);
    }
}
