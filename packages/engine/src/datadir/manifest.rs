//! The installed-modules manifest (`modules.json`).
//!
//! Written by the toolchain on `init`; lists every installed sub-module with
//! its source address, pinned version, and on-disk location. The shape on
//! disk matches the toolchain's own serialization, so field names are
//! PascalCase and unknown keys are tolerated.

use std::path::{Path, PathBuf};

use semver::Version;
use serde::Deserialize;
use tracing::trace;

use super::module_manifest_file_path;
use crate::{
    error::{EngineError, Result},
    path::{clean, from_slash, path_equals},
    vfs::Filesystem,
};

/// Metadata about one installed module.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ModuleRecord {
    /// Unique identifier of the module within the static module tree.
    /// Empty for the root module.
    pub key: String,

    /// The source address as given in configuration. Used only to detect
    /// whether the source changed since installation.
    pub source_addr: String,

    /// Exact installed version, parsed from `version_str`. `None` for
    /// un-versioned modules.
    pub version: Option<Version>,

    /// The raw version specifier as serialized in the manifest.
    pub version_str: String,

    /// Install location relative to the manifest's root directory, in
    /// native separator form and cleaned.
    pub dir: PathBuf,
}

impl ModuleRecord {
    /// Whether this record describes the root module.
    pub fn is_root(&self) -> bool {
        self.key.is_empty()
    }

    /// Whether this module is installed under the datadir module cache.
    pub fn is_external(&self) -> bool {
        let cache_dir = Path::new(super::DATA_DIR_NAME).join("modules");
        self.dir.starts_with(cache_dir)
    }
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default, rename = "Key")]
    key: String,
    #[serde(default, rename = "Source")]
    source: String,
    #[serde(default, rename = "Version")]
    version: String,
    #[serde(default, rename = "Dir")]
    dir: String,
}

impl TryFrom<RawRecord> for ModuleRecord {
    type Error = EngineError;

    fn try_from(raw: RawRecord) -> Result<Self> {
        let version = if raw.version.is_empty() {
            None
        } else {
            let parsed = Version::parse(&raw.version).map_err(|err| {
                EngineError::Parse(format!(
                    "invalid version {:?} for {:?}: {err}",
                    raw.version, raw.key
                ))
            })?;
            Some(parsed)
        };

        Ok(ModuleRecord {
            key: raw.key,
            source_addr: raw.source,
            version,
            version_str: raw.version,
            dir: clean(&from_slash(&raw.dir)),
        })
    }
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default, rename = "Modules")]
    modules: Vec<RawRecord>,
}

/// An ordered list of installed-module records plus the directory the
/// manifest was read for.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ModuleManifest {
    root_dir: PathBuf,
    pub records: Vec<ModuleRecord>,
}

impl ModuleManifest {
    /// The module directory the manifest belongs to (the directory holding
    /// the datadir).
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.records
    }

    /// Whether any non-root, non-external record installs to `query_path`.
    /// Record locations are resolved against the manifest root before
    /// comparison.
    pub fn references_module(&self, query_path: &Path) -> bool {
        self.records.iter().any(|record| {
            if record.is_root() {
                // the root module is tracked separately
                return false;
            }
            if record.is_external() {
                // external modules live in the cache and are not edited
                return false;
            }
            let abs = clean(&self.root_dir.join(&record.dir));
            path_equals(&abs, query_path)
        })
    }
}

/// Parse manifest bytes read for `root_dir`. Empty bytes are treated as the
/// empty JSON object, matching the toolchain's own reader.
pub fn parse_manifest_bytes(bytes: &[u8], root_dir: impl Into<PathBuf>) -> Result<ModuleManifest> {
    let bytes = if bytes.is_empty() { b"{}" } else { bytes };
    let raw: RawManifest = serde_json::from_slice(bytes)
        .map_err(|err| EngineError::Parse(format!("malformed module manifest: {err}")))?;

    let records = raw
        .modules
        .into_iter()
        .map(ModuleRecord::try_from)
        .collect::<Result<Vec<_>>>()?;

    Ok(ModuleManifest {
        root_dir: root_dir.into(),
        records,
    })
}

/// Read and parse the installed-modules manifest of `module_path`.
///
/// Symbolic links in the manifest location are not followed. Absence of the
/// manifest surfaces as [`EngineError::NotFound`], which callers demote to
/// "no manifest" rather than failure.
pub async fn parse_installed_modules(
    fs: &Filesystem,
    module_path: &Path,
) -> Result<ModuleManifest> {
    let manifest_path = module_manifest_file_path(module_path);
    let bytes = fs.read_file(&manifest_path).await?;
    trace!(path = %manifest_path.display(), len = bytes.len(), "read module manifest");
    parse_manifest_bytes(&bytes, module_path)
}
