//! Layout of the toolchain's per-module metadata directory.
//!
//! Terraform writes everything it learns about a module into a hidden
//! `.terraform` directory next to the configuration, plus a lock file whose
//! location moved twice across releases. This module knows those layouts:
//! it maps a module directory to the artifact paths worth watching, and maps
//! an arbitrary file path back to the module it belongs to.

mod manifest;
mod plugin_lock;

use std::path::{Path, PathBuf};

pub use manifest::{ModuleManifest, ModuleRecord, parse_manifest_bytes, parse_installed_modules};
pub use plugin_lock::{find_plugin_lock_file, plugin_lock_file_paths};

use crate::{
    path::{ModulePath, clean},
    vfs::{FileKind, Filesystem},
};

/// Name of the hidden metadata directory.
pub const DATA_DIR_NAME: &str = ".terraform";

/// Which datadir artifact a path resolved to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Artifact {
    ModuleManifest,
    PluginLock,
}

/// Concrete artifact paths discovered for one module, in the shape the
/// watcher consumes. Empty fields mean the artifact does not exist yet.
#[derive(Clone, Debug, Default)]
pub struct DataDirSummary {
    pub module_manifest_path: Option<PathBuf>,
    pub plugin_lock_file_path: Option<PathBuf>,
}

/// Path of the installed-modules manifest for a module directory.
pub fn module_manifest_file_path(module_path: &Path) -> PathBuf {
    module_path
        .join(DATA_DIR_NAME)
        .join("modules")
        .join("modules.json")
}

/// All artifact paths the watcher should observe for a module, whether or
/// not they exist yet.
pub fn paths_to_watch(module_path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![module_manifest_file_path(module_path)];
    paths.extend(plugin_lock_file_paths(module_path));
    paths
}

/// Strip a known artifact suffix from `file_path`, recovering the module
/// directory the artifact belongs to. The reverse of the path builders
/// above. Returns the cleaned module path and which artifact matched.
pub fn module_path(file_path: &Path) -> Option<(ModulePath, Artifact)> {
    let manifest_suffix = Path::new(DATA_DIR_NAME).join("modules").join("modules.json");
    if let Some(prefix) = strip_path_suffix(file_path, &manifest_suffix) {
        return Some((ModulePath::new(prefix), Artifact::ModuleManifest));
    }

    for suffix in plugin_lock::plugin_lock_file_suffixes() {
        if let Some(prefix) = strip_path_suffix(file_path, &suffix) {
            return Some((ModulePath::new(prefix), Artifact::PluginLock));
        }
    }

    None
}

fn strip_path_suffix<'a>(path: &'a Path, suffix: &Path) -> Option<&'a Path> {
    if !path.ends_with(suffix) {
        return None;
    }
    path.ancestors().nth(suffix.components().count())
}

/// Probe the datadir of a module, recording the manifest and the first
/// existing plugin-lock candidate.
pub async fn walk_data_dir(fs: &Filesystem, module_path: &Path) -> DataDirSummary {
    let mut summary = DataDirSummary::default();

    let manifest_path = module_manifest_file_path(module_path);
    if fs.exists(&manifest_path).await {
        summary.module_manifest_path = Some(manifest_path);
    }

    summary.plugin_lock_file_path = find_plugin_lock_file(fs, module_path).await;
    summary
}

/// Whether the toolchain has initialized this module (its datadir exists
/// and is a directory).
pub async fn is_initialized(fs: &Filesystem, module_path: &Path) -> crate::error::Result<bool> {
    let datadir = clean(&module_path.join(DATA_DIR_NAME));
    match fs.metadata(&datadir).await {
        Ok(kind) => Ok(kind == FileKind::Dir),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}
