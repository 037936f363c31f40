//! The module registry: the only owner of [`Module`] records.
//!
//! Workspaces hold tens, occasionally hundreds of modules, so membership is
//! a plain ordered list scanned linearly. The membership lock covers only
//! additions and listing; all per-module state lives behind the module's own
//! slot locks.

use std::{path::Path, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    error::{EngineError, Result},
    module::Module,
    path::ModulePath,
    vfs::Filesystem,
};

pub struct ModuleRegistry {
    fs: Filesystem,
    modules: RwLock<Vec<Arc<Module>>>,
}

impl ModuleRegistry {
    pub fn new(fs: Filesystem) -> Self {
        Self {
            fs,
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Register the directory at `path`, creating an empty module record.
    /// Registering the same directory twice is an error.
    pub fn add(&self, path: ModulePath) -> Result<Arc<Module>> {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.path() == &path) {
            return Err(EngineError::AlreadyRegistered(path.as_path().to_path_buf()));
        }

        debug!(path = %path, "register module");
        let module = Arc::new(Module::new(self.fs.clone(), path));
        modules.push(Arc::clone(&module));
        Ok(module)
    }

    /// Look up the module registered for `path`.
    pub fn by_path(&self, path: &Path) -> Result<Arc<Module>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.matches_path(path))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(path.to_path_buf()))
    }

    /// Snapshot of all registered modules, in registration order.
    pub fn list(&self) -> Vec<Arc<Module>> {
        self.modules.read().clone()
    }

    /// Whether the module has any open editor buffer under it.
    pub fn has_open_files(&self, module: &Module) -> bool {
        module.has_open_files()
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }
}
