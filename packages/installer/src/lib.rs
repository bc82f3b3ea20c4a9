//! Dependency installer for packbox project file systems.
//!
//! Resolution asks the registry CDN for a concrete dependency set keyed by
//! the packages fingerprint; fetching populates `/node_modules` under a
//! bounded concurrent queue with retries. Both steps are memoised, the first
//! in the local cache tier, the second in the persistent tier.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use packbox_cache::{LocalCache, PersistentCache};
use packbox_http::{get_with_timeout, HttpClient};
use packbox_vfs::Vfs;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};

pub mod resolver;

pub use resolver::{
    dist_tags_to_dependencies, merge_dependencies, packages_hash, parse_package_json, BinField,
    PackageJson, PACKAGE_JSON_HASH_PATH,
};

/// Where the executable-script map is persisted on the FS.
pub const SCRIPTS_JSON_PATH: &str = "/node_modules/.scripts.json";

/// Global bound on simultaneous module fetches.
pub const MAX_CONCURRENT_FETCHES: usize = 10;
/// Per-request deadline.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Attempts per module request.
pub const MAX_FETCH_ATTEMPTS: usize = 3;
/// Fixed (not exponential) pause between attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Info,
    Error,
}

/// One progress record emitted at phase boundaries and per-package events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub level: ProgressLevel,
    pub message: String,
}

pub type ProgressSender = flume::Sender<ProgressEvent>;

fn send_progress(progress: Option<&ProgressSender>, level: ProgressLevel, message: String) {
    log::debug!("npm progress [{}]: {message}", level.as_ref());
    if let Some(tx) = progress {
        if let Err(e) = tx.send(ProgressEvent { level, message }) {
            log::trace!("Progress receiver gone: {e:?}");
        }
    }
}

/// Options for a resolve or install run.
#[derive(Default, Clone)]
pub struct InstallOptions {
    pub registry_base_url: String,
    /// Caller-supplied overrides merged over the manifest's dependencies.
    pub dependencies: BTreeMap<String, String>,
    pub progress: Option<ProgressSender>,
}

#[derive(Debug, Error)]
pub enum ResolveDependenciesError {
    #[error(transparent)]
    Http(#[from] packbox_http::Error),
    #[error(transparent)]
    PackageJson(#[from] serde_json::Error),
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Resolve(#[from] ResolveDependenciesError),
    #[error(transparent)]
    Http(#[from] packbox_http::Error),
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
    #[error(transparent)]
    Acquire(#[from] tokio::sync::AcquireError),
}

#[derive(Debug, Error)]
pub enum PackageScriptError {
    #[error(transparent)]
    PackageJson(#[from] serde_json::Error),
    #[error("No script named '{0}'")]
    NotFound(String),
}

/// The installer. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct NpmInstaller {
    http: Arc<dyn HttpClient>,
    local_cache: Arc<LocalCache>,
    persistent_cache: PersistentCache,
    script_map: Arc<std::sync::RwLock<BTreeMap<String, String>>>,
}

impl NpmInstaller {
    #[must_use]
    pub fn new(
        http: Arc<dyn HttpClient>,
        local_cache: Arc<LocalCache>,
        persistent_cache: PersistentCache,
    ) -> Self {
        Self {
            http,
            local_cache,
            persistent_cache,
            script_map: Arc::new(std::sync::RwLock::new(BTreeMap::new())),
        }
    }

    /// Resolve the project's dependency set against the CDN.
    ///
    /// Returns `None` when the fingerprint matches the one recorded on the
    /// FS from the previous resolution, signalling nothing to do.
    ///
    /// # Errors
    ///
    /// * If `package.json` is present but unparseable
    /// * If the CDN request fails or its payload cannot be decoded
    pub async fn resolve_dependencies(
        &self,
        fs: &Arc<RwLock<Vfs>>,
        options: &InstallOptions,
    ) -> Result<Option<BTreeMap<String, String>>, ResolveDependenciesError> {
        let (manifest_text, previous_hash) = {
            let fs = fs.read().await;
            let manifest_path = format!("{}/package.json", fs.cwd());
            (
                fs.read_file(&manifest_path),
                fs.read_file(PACKAGE_JSON_HASH_PATH),
            )
        };

        let manifest = parse_package_json(&manifest_text)?;
        let merged = merge_dependencies(&manifest, &options.dependencies);
        let fingerprint = packages_hash(&merged);

        if fingerprint == previous_hash {
            log::debug!("Dependency fingerprint unchanged: {fingerprint}");
            send_progress(
                options.progress.as_ref(),
                ProgressLevel::Info,
                "Dependencies unchanged".to_string(),
            );
            return Ok(None);
        }

        let request_path = format!("/v2/deps/{fingerprint}");
        let url = format!("{}{request_path}", options.registry_base_url);
        let http = self.http.clone();

        let dist_tags = self
            .local_cache
            .with_local_cache_data(
                &request_path,
                || async move {
                    log::debug!("Resolving dependency set via {url}");
                    get_with_timeout(http.as_ref(), &url, FETCH_TIMEOUT)
                        .await?
                        .ok_bytes(&url)
                        .map_err(ResolveDependenciesError::from)
                },
                |data| {
                    rmp_serde::from_slice::<BTreeMap<String, String>>(data)
                        .map_err(ResolveDependenciesError::from)
                },
            )
            .await?;

        let resolved = dist_tags_to_dependencies(&dist_tags);

        fs.write().await.write_file(PACKAGE_JSON_HASH_PATH, &fingerprint);

        send_progress(
            options.progress.as_ref(),
            ProgressLevel::Info,
            format!("Resolved {} dependencies", resolved.len()),
        );

        Ok(Some(resolved))
    }

    /// Resolve, fetch, and populate `/node_modules`, then persist the script
    /// map at `/node_modules/.scripts.json`.
    ///
    /// One failed package rejects the whole install; files already written
    /// by completed packages are not rolled back.
    ///
    /// # Errors
    ///
    /// * If resolution fails
    /// * If any package fetch exhausts its retries or fails to decode
    pub async fn install(
        &self,
        fs: &Arc<RwLock<Vfs>>,
        options: &InstallOptions,
    ) -> Result<(), InstallError> {
        send_progress(
            options.progress.as_ref(),
            ProgressLevel::Info,
            "Resolving dependencies".to_string(),
        );

        let Some(resolved) = self.resolve_dependencies(fs, options).await? else {
            return Ok(());
        };

        send_progress(
            options.progress.as_ref(),
            ProgressLevel::Info,
            format!("Installing {} packages", resolved.len()),
        );

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));

        let entries = futures::future::try_join_all(resolved.iter().map(|(name, version)| {
            let installer = self.clone();
            let semaphore = semaphore.clone();
            let fs = fs.clone();
            async move {
                let _permit = semaphore.acquire_owned().await?;
                installer.install_package(&fs, options, name, version).await
            }
        }))
        .await?;

        let mut script_map = BTreeMap::new();
        for entry in entries {
            script_map.extend(entry);
        }

        let script_json =
            serde_json::to_string(&script_map).unwrap_or_else(|_| "{}".to_string());
        fs.write().await.write_file(SCRIPTS_JSON_PATH, script_json);
        *self.script_map.write().unwrap() = script_map;

        send_progress(
            options.progress.as_ref(),
            ProgressLevel::Info,
            format!("Installed {} packages", resolved.len()),
        );

        Ok(())
    }

    async fn install_package(
        &self,
        fs: &Arc<RwLock<Vfs>>,
        options: &InstallOptions,
        name: &str,
        version: &str,
    ) -> Result<BTreeMap<String, String>, InstallError> {
        let manifest_path = format!("/node_modules/{name}/package.json");

        {
            let fs = fs.read().await;
            if let Ok(existing) = parse_package_json(&fs.read_file(&manifest_path)) {
                if existing.version.as_deref() == Some(version) {
                    send_progress(
                        options.progress.as_ref(),
                        ProgressLevel::Info,
                        format!("{name}@{version} already installed"),
                    );
                    return Ok(script_entries(name, &existing));
                }
            }
        }

        let request_path = format!("/v2/mod/{}", BASE64.encode(format!("{name}@{version}")));

        send_progress(
            options.progress.as_ref(),
            ProgressLevel::Info,
            format!(
                "{name}@{version}: cache {}",
                if self.persistent_cache.is_cached(&request_path) {
                    "hit"
                } else {
                    "miss"
                }
            ),
        );

        let url = format!("{}{request_path}", options.registry_base_url);
        let http = self.http.clone();

        let files = self
            .persistent_cache
            .with_cache_data(
                &request_path,
                || fetch_module(http, url),
                |data| {
                    rmp_serde::from_slice::<BTreeMap<String, serde_bytes::ByteBuf>>(data)
                        .map_err(InstallError::from)
                },
            )
            .await?;

        self.persistent_cache.touch(&format!("{name}@{version}"));

        {
            let mut fs = fs.write().await;
            for (relative_path, contents) in &files {
                let path = format!("/node_modules/{name}/{relative_path}");
                fs.write_file(&path, String::from_utf8_lossy(contents.as_ref()).into_owned());
            }
        }

        let manifest = {
            let fs = fs.read().await;
            parse_package_json(&fs.read_file(&manifest_path)).unwrap_or_default()
        };

        Ok(script_entries(name, &manifest))
    }

    /// `(cmd, args)` derived from `package.json.scripts[script]` at the FS
    /// working directory.
    ///
    /// # Errors
    ///
    /// * If `package.json` is unparseable
    /// * If no script with that name exists
    pub fn package_script(
        fs: &Vfs,
        script: &str,
    ) -> Result<(String, Vec<String>), PackageScriptError> {
        let manifest_path = format!("{}/package.json", fs.cwd());
        let manifest = parse_package_json(&fs.read_file(&manifest_path))?;

        let command = manifest
            .scripts
            .get(script)
            .ok_or_else(|| PackageScriptError::NotFound(script.to_string()))?;

        let mut parts = command.split_whitespace().map(ToString::to_string);
        let cmd = parts
            .next()
            .ok_or_else(|| PackageScriptError::NotFound(script.to_string()))?;

        Ok((cmd, parts.collect()))
    }

    /// Absolute entry path for an executable installed by the most recent
    /// `install`, or `None`.
    #[must_use]
    pub fn dependency_scripts(&self, cmd: &str) -> Option<String> {
        self.script_map.read().unwrap().get(cmd).cloned()
    }
}

/// Executable-name to entry-path mapping contributed by one package.
fn script_entries(module_name: &str, manifest: &PackageJson) -> BTreeMap<String, String> {
    let own_name = manifest
        .name
        .clone()
        .unwrap_or_else(|| module_name.to_string());

    match &manifest.bin {
        Some(BinField::Path(path)) => {
            BTreeMap::from([(own_name, resolve_module_path(module_name, path))])
        }
        Some(BinField::Map(bins)) => bins
            .iter()
            .map(|(cmd, path)| (cmd.clone(), resolve_module_path(module_name, path)))
            .collect(),
        None => manifest.main.as_ref().map_or_else(BTreeMap::new, |main| {
            BTreeMap::from([(own_name, resolve_module_path(module_name, main))])
        }),
    }
}

fn resolve_module_path(module_name: &str, relative: &str) -> String {
    format!(
        "/node_modules/{module_name}/{}",
        relative.trim_start_matches("./")
    )
}

async fn fetch_module(http: Arc<dyn HttpClient>, url: String) -> Result<Bytes, InstallError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match get_with_timeout(http.as_ref(), &url, FETCH_TIMEOUT)
            .await
            .and_then(|response| response.ok_bytes(&url))
        {
            Ok(data) => return Ok(data),
            Err(e) if attempt < MAX_FETCH_ATTEMPTS => {
                log::debug!("Fetch attempt {attempt} for {url} failed, retrying: {e:?}");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => {
                log::error!("Fetch for {url} failed after {attempt} attempts: {e:?}");
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use packbox_http::simulator::{SimulatorClient, Step};
    use pretty_assertions::assert_eq;

    use super::*;

    const REGISTRY: &str = "http://registry.test";

    fn rmp_strings(entries: &[(&str, &str)]) -> Vec<u8> {
        let map = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>();
        rmp_serde::to_vec(&map).unwrap()
    }

    fn rmp_files(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let map = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_bytes::ByteBuf::from(v.to_vec())))
            .collect::<BTreeMap<_, _>>();
        rmp_serde::to_vec(&map).unwrap()
    }

    fn new_installer(client: Arc<SimulatorClient>) -> NpmInstaller {
        NpmInstaller::new(
            client,
            Arc::new(LocalCache::new()),
            PersistentCache::open_in_memory().unwrap(),
        )
    }

    fn project_fs(dependencies: &str) -> Arc<RwLock<Vfs>> {
        let mut fs = Vfs::new();
        fs.write_file(
            "/app/package.json",
            format!(r#"{{"dependencies": {dependencies}}}"#),
        );
        Arc::new(RwLock::new(fs))
    }

    fn deps_url(dependencies: &BTreeMap<String, String>) -> String {
        format!("{REGISTRY}/v2/deps/{}", packages_hash(dependencies))
    }

    fn mod_url(name: &str, version: &str) -> String {
        format!("{REGISTRY}/v2/mod/{}", BASE64.encode(format!("{name}@{version}")))
    }

    #[test_log::test(tokio::test)]
    async fn consecutive_resolves_issue_exactly_one_network_call() {
        let client = Arc::new(SimulatorClient::new());
        let deps = BTreeMap::from([("x".to_string(), "^1".to_string())]);
        client.insert(deps_url(&deps), rmp_strings(&[("x@1", "1.0.0")]));

        let installer = new_installer(client.clone());
        let fs = project_fs(r#"{"x": "^1"}"#);
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            ..Default::default()
        };

        let first = installer
            .resolve_dependencies(&fs, &options)
            .await
            .unwrap();
        assert_eq!(
            first,
            Some(BTreeMap::from([("x".to_string(), "1.0.0".to_string())]))
        );

        let second = installer
            .resolve_dependencies(&fs, &options)
            .await
            .unwrap();
        assert_eq!(second, None);

        assert_eq!(client.requests().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn prewarmed_local_cache_resolves_with_zero_network_calls() {
        let client = Arc::new(SimulatorClient::new());
        let installer = new_installer(client.clone());

        let deps = BTreeMap::from([("x".to_string(), "^1".to_string())]);
        installer.local_cache.insert(
            format!("/v2/deps/{}", packages_hash(&deps)),
            rmp_strings(&[("x@0", "1")]),
        );

        let fs = project_fs(r#"{"x": "^1"}"#);
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            ..Default::default()
        };

        let resolved = installer
            .resolve_dependencies(&fs, &options)
            .await
            .unwrap();

        assert_eq!(
            resolved,
            Some(BTreeMap::from([("x".to_string(), "1".to_string())]))
        );
        assert_eq!(client.requests().len(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn install_populates_the_module_tree_and_script_map() {
        let client = Arc::new(SimulatorClient::new());
        let deps = BTreeMap::from([("x".to_string(), "1".to_string())]);
        client.insert(deps_url(&deps), rmp_strings(&[("x@1", "1")]));
        client.insert(
            mod_url("x", "1"),
            rmp_files(&[
                (
                    "package.json",
                    br#"{"name":"x","version":"1","main":"i.js"}"#,
                ),
                ("i.js", b"X"),
            ]),
        );

        let installer = new_installer(client.clone());
        let fs = project_fs(r#"{"x": "1"}"#);
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            ..Default::default()
        };

        installer.install(&fs, &options).await.unwrap();

        let fs = fs.read().await;
        let manifest = parse_package_json(&fs.read_file("/node_modules/x/package.json")).unwrap();
        assert_eq!(manifest.version.as_deref(), Some("1"));
        assert_eq!(fs.read_file("/node_modules/x/i.js"), "X");

        let scripts: BTreeMap<String, String> =
            serde_json::from_str(&fs.read_file(SCRIPTS_JSON_PATH)).unwrap();
        assert_eq!(
            scripts,
            BTreeMap::from([("x".to_string(), "/node_modules/x/i.js".to_string())])
        );

        assert_eq!(
            installer.dependency_scripts("x").as_deref(),
            Some("/node_modules/x/i.js")
        );

        assert_eq!(
            fs.read_file(PACKAGE_JSON_HASH_PATH),
            packages_hash(&deps)
        );
    }

    #[test_log::test(tokio::test)]
    async fn second_install_issues_no_module_downloads() {
        let client = Arc::new(SimulatorClient::new());
        let deps = BTreeMap::from([("x".to_string(), "1".to_string())]);
        client.insert(deps_url(&deps), rmp_strings(&[("x@1", "1")]));
        client.insert(
            mod_url("x", "1"),
            rmp_files(&[("package.json", br#"{"name":"x","version":"1"}"#)]),
        );

        let installer = new_installer(client.clone());
        let fs = project_fs(r#"{"x": "1"}"#);
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            ..Default::default()
        };

        installer.install(&fs, &options).await.unwrap();
        assert_eq!(client.request_count(&mod_url("x", "1")), 1);

        // Force a fresh resolution so the second run reaches the per-package
        // version check instead of the fingerprint short-circuit.
        fs.write().await.delete_file(PACKAGE_JSON_HASH_PATH);

        installer.install(&fs, &options).await.unwrap();
        assert_eq!(client.request_count(&mod_url("x", "1")), 1);
    }

    #[test_log::test(tokio::test)]
    async fn module_fetch_retries_with_fixed_backoff() {
        tokio::time::pause();

        let client = Arc::new(SimulatorClient::new());
        let deps = BTreeMap::from([("x".to_string(), "1".to_string())]);
        client.insert(deps_url(&deps), rmp_strings(&[("x@1", "1")]));
        client.insert_steps(
            mod_url("x", "1"),
            vec![
                Step::Status(500),
                Step::Status(500),
                Step::Bytes(
                    rmp_files(&[("package.json", br#"{"name":"x","version":"1"}"#)]).into(),
                ),
            ],
        );

        let installer = new_installer(client.clone());
        let fs = project_fs(r#"{"x": "1"}"#);
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            ..Default::default()
        };

        installer.install(&fs, &options).await.unwrap();

        assert_eq!(client.request_count(&mod_url("x", "1")), 3);
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_reject_the_whole_install() {
        tokio::time::pause();

        let client = Arc::new(SimulatorClient::new());
        let deps = BTreeMap::from([("x".to_string(), "1".to_string())]);
        client.insert(deps_url(&deps), rmp_strings(&[("x@1", "1")]));
        client.insert_steps(mod_url("x", "1"), vec![Step::Status(500)]);

        let installer = new_installer(client.clone());
        let fs = project_fs(r#"{"x": "1"}"#);
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            ..Default::default()
        };

        let err = installer.install(&fs, &options).await.unwrap_err();
        assert!(matches!(err, InstallError::Http(_)));
        assert_eq!(client.request_count(&mod_url("x", "1")), 3);
    }

    #[test_log::test(tokio::test)]
    async fn progress_reports_phase_boundaries_and_cache_misses() {
        let client = Arc::new(SimulatorClient::new());
        let deps = BTreeMap::from([("x".to_string(), "1".to_string())]);
        client.insert(deps_url(&deps), rmp_strings(&[("x@1", "1")]));
        client.insert(
            mod_url("x", "1"),
            rmp_files(&[("package.json", br#"{"name":"x","version":"1"}"#)]),
        );

        let installer = new_installer(client);
        let fs = project_fs(r#"{"x": "1"}"#);
        let (tx, rx) = flume::unbounded();
        let options = InstallOptions {
            registry_base_url: REGISTRY.to_string(),
            dependencies: BTreeMap::new(),
            progress: Some(tx),
        };

        installer.install(&fs, &options).await.unwrap();

        let messages = rx.drain().map(|x| x.message).collect::<Vec<_>>();
        assert!(messages.iter().any(|x| x.contains("Resolving")));
        assert!(messages.iter().any(|x| x.contains("cache miss")));
        assert!(messages.iter().any(|x| x.contains("Installed 1 packages")));
    }

    #[test_log::test(tokio::test)]
    async fn package_script_splits_command_and_args() {
        let mut fs = Vfs::new();
        fs.write_file(
            "/app/package.json",
            r#"{"scripts": {"build": "esbuild src/index.js --bundle"}}"#,
        );

        let (cmd, args) = NpmInstaller::package_script(&fs, "build").unwrap();
        assert_eq!(cmd, "esbuild");
        assert_eq!(args, vec!["src/index.js".to_string(), "--bundle".to_string()]);

        let err = NpmInstaller::package_script(&fs, "missing").unwrap_err();
        assert!(matches!(err, PackageScriptError::NotFound(_)));
    }

    #[test_log::test]
    fn bin_map_produces_one_entry_per_key() {
        let manifest = parse_package_json(
            r#"{"name": "tool", "bin": {"tool": "./cli.js", "tool-dev": "dev.js"}}"#,
        )
        .unwrap();

        let entries = script_entries("tool", &manifest);
        assert_eq!(
            entries,
            BTreeMap::from([
                ("tool".to_string(), "/node_modules/tool/cli.js".to_string()),
                (
                    "tool-dev".to_string(),
                    "/node_modules/tool/dev.js".to_string()
                ),
            ])
        );
    }

    #[test_log::test]
    fn string_bin_uses_the_package_name() {
        let manifest =
            parse_package_json(r#"{"name": "tool", "bin": "./bin/run.js"}"#).unwrap();

        let entries = script_entries("tool", &manifest);
        assert_eq!(
            entries,
            BTreeMap::from([("tool".to_string(), "/node_modules/tool/bin/run.js".to_string())])
        );
    }
}
