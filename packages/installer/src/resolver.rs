//! Dependency resolution against the registry CDN.
//!
//! The resolver never interprets semver ranges itself; it fingerprints the
//! requested dependency set and asks the CDN for the concrete versions.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

/// Where the fingerprint of the last successful resolution lives on the FS.
pub const PACKAGE_JSON_HASH_PATH: &str = "/~system/package-json-hash";

/// The slice of `package.json` the installer cares about.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PackageJson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub bin: Option<BinField>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "peerDependencies", default)]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

/// `bin` is either a single path or a map of executable name to path.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BinField {
    Path(String),
    Map(BTreeMap<String, String>),
}

/// Parses `package.json` text. An absent file reads back as the empty string
/// from the FS, which parses as an empty manifest.
///
/// # Errors
///
/// * If the contents are present but not valid JSON
pub fn parse_package_json(contents: &str) -> Result<PackageJson, serde_json::Error> {
    if contents.trim().is_empty() {
        return Ok(PackageJson::default());
    }
    serde_json::from_str(contents)
}

/// Merge `dependencies` and `peerDependencies` with caller overrides.
/// `devDependencies` are deliberately excluded; overrides win.
#[must_use]
pub fn merge_dependencies(
    manifest: &PackageJson,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = manifest.dependencies.clone();
    merged.extend(
        manifest
            .peer_dependencies
            .iter()
            .map(|(name, version)| (name.clone(), version.clone())),
    );
    merged.extend(
        overrides
            .iter()
            .map(|(name, version)| (name.clone(), version.clone())),
    );
    merged
}

/// Canonical fingerprint of a dependency set: base64 of `name@version`
/// entries sorted lexicographically by name and joined with `;`.
#[must_use]
pub fn packages_hash(dependencies: &BTreeMap<String, String>) -> String {
    let joined = dependencies
        .iter()
        .map(|(name, version)| format!("{name}@{version}"))
        .collect::<Vec<_>>()
        .join(";");
    BASE64.encode(joined)
}

/// Strip the trailing `@major` qualifier from a distTags key, preserving
/// scoped names (`@scope/name@2` becomes `@scope/name`).
#[must_use]
pub fn strip_major(key: &str) -> &str {
    key.rsplit_once('@').map_or(key, |(name, _major)| name)
}

/// Turn the CDN's `name@major -> version` map into `name -> version`.
#[must_use]
pub fn dist_tags_to_dependencies(
    dist_tags: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    dist_tags
        .iter()
        .map(|(key, version)| (strip_major(key).to_string(), version.clone()))
        .collect()
}
