//! Locations of the provider plugin-lock file across toolchain releases.

use std::{
    env::consts,
    path::{Path, PathBuf},
};

use super::DATA_DIR_NAME;
use crate::vfs::Filesystem;

/// Lock-file paths relative to a module directory, newest layout first.
pub(super) fn plugin_lock_file_suffixes() -> [PathBuf; 3] {
    [
        // Terraform >= 0.14
        PathBuf::from(".terraform.lock.hcl"),
        // Terraform >= 0.13
        Path::new(DATA_DIR_NAME).join("plugins").join("selections.json"),
        // Terraform <= 0.12
        Path::new(DATA_DIR_NAME)
            .join("plugins")
            .join(format!("{}_{}", consts::OS, consts::ARCH))
            .join("lock.json"),
    ]
}

/// Candidate lock-file paths for a module, newest layout first.
pub fn plugin_lock_file_paths(module_path: &Path) -> Vec<PathBuf> {
    plugin_lock_file_suffixes()
        .into_iter()
        .map(|suffix| module_path.join(suffix))
        .collect()
}

/// The first existing lock-file candidate, searched newest layout first.
pub async fn find_plugin_lock_file(fs: &Filesystem, module_path: &Path) -> Option<PathBuf> {
    for candidate in plugin_lock_file_paths(module_path) {
        if fs.exists(&candidate).await {
            return Some(candidate);
        }
    }
    None
}
