//! The per-directory module record.
//!
//! Each module holds four independent state slots, one per operation kind,
//! each behind its own reader-writer lock. A long configuration parse must
//! never block a quick read of the toolchain version, so no method takes
//! more than one slot lock and no lock is held across I/O.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use semver::Version;
use strum::Display;

use crate::{
    datadir::{ModuleManifest, ModuleRecord},
    error::EngineError,
    exec::{ProviderSchemas, VersionInfo},
    path::ModulePath,
    syntax::{Diagnostic, ParsedFile},
    vfs::Filesystem,
};

/// Progress of one operation slot.
///
/// Transitions are monotonic within a cycle:
/// Unknown → Queued → Loading → Loaded, then Queued again on re-enqueue.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Default)]
pub enum OpState {
    #[default]
    Unknown,
    Queued,
    Loading,
    Loaded,
}

/// The operations the scheduler can run against a module.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum OpKind {
    GetVersion,
    ObtainSchema,
    ParseConfiguration,
    ParseModuleManifest,
}

impl OpKind {
    /// All kinds, in bootstrap order.
    pub const ALL: [OpKind; 4] = [
        OpKind::ParseConfiguration,
        OpKind::ParseModuleManifest,
        OpKind::GetVersion,
        OpKind::ObtainSchema,
    ];
}

#[derive(Default)]
struct ParserSlot {
    state: OpState,
    error: Option<EngineError>,
    files: HashMap<String, ParsedFile>,
    diagnostics: HashMap<String, Vec<Diagnostic>>,
}

#[derive(Default)]
struct ManifestSlot {
    state: OpState,
    error: Option<EngineError>,
    manifest: Option<Arc<ModuleManifest>>,
}

#[derive(Default)]
struct VersionSlot {
    state: OpState,
    error: Option<EngineError>,
    exec_path: Option<PathBuf>,
    version: Option<Version>,
    provider_versions: HashMap<String, Version>,
}

#[derive(Default)]
struct SchemaSlot {
    state: OpState,
    error: Option<EngineError>,
    schemas: Option<ProviderSchemas>,
}

/// All derived state the engine maintains for one module directory.
///
/// Shared as `Arc<Module>`; the registry owns the only long-lived
/// collection of these.
pub struct Module {
    path: ModulePath,
    fs: Filesystem,

    parser: RwLock<ParserSlot>,
    manifest: RwLock<ManifestSlot>,
    version: RwLock<VersionSlot>,
    schema: RwLock<SchemaSlot>,
}

impl Module {
    pub(crate) fn new(fs: Filesystem, path: ModulePath) -> Self {
        Self {
            path,
            fs,
            parser: RwLock::default(),
            manifest: RwLock::default(),
            version: RwLock::default(),
            schema: RwLock::default(),
        }
    }

    pub fn path(&self) -> &ModulePath {
        &self.path
    }

    pub fn matches_path(&self, path: &Path) -> bool {
        self.path.matches(path)
    }

    /// Shorter path for display, relative to a workspace root.
    pub fn human_readable_path(&self, root: &Path) -> String {
        self.path.human_readable(root)
    }

    /// Whether the user has any file under this module open in an editor.
    /// Drives scheduling priority.
    pub fn has_open_files(&self) -> bool {
        self.fs.has_open_files(self.path.as_path())
    }

    // parsed configuration

    pub fn parsed_files(&self) -> HashMap<String, ParsedFile> {
        self.parser.read().files.clone()
    }

    pub fn diagnostics(&self) -> HashMap<String, Vec<Diagnostic>> {
        self.parser.read().diagnostics.clone()
    }

    pub fn parser_state(&self) -> OpState {
        self.parser.read().state
    }

    pub fn parser_error(&self) -> Option<EngineError> {
        self.parser.read().error.clone()
    }

    pub(crate) fn set_parsed_config(
        &self,
        files: HashMap<String, ParsedFile>,
        diagnostics: HashMap<String, Vec<Diagnostic>>,
    ) {
        let mut slot = self.parser.write();
        slot.files = files;
        slot.diagnostics = diagnostics;
    }

    // installed-modules manifest

    pub fn module_manifest(&self) -> Option<Arc<ModuleManifest>> {
        self.manifest.read().manifest.clone()
    }

    pub fn manifest_state(&self) -> OpState {
        self.manifest.read().state
    }

    pub fn manifest_error(&self) -> Option<EngineError> {
        self.manifest.read().error.clone()
    }

    /// The manifest's records, empty when no manifest has been loaded.
    pub fn module_calls(&self) -> Vec<ModuleRecord> {
        self.manifest
            .read()
            .manifest
            .as_ref()
            .map(|m| m.records().to_vec())
            .unwrap_or_default()
    }

    /// Whether this module's manifest references the module at `path`.
    pub fn calls_module(&self, path: &Path) -> bool {
        self.manifest
            .read()
            .manifest
            .as_ref()
            .is_some_and(|m| m.references_module(path))
    }

    pub(crate) fn set_manifest(&self, manifest: Option<Arc<ModuleManifest>>) {
        self.manifest.write().manifest = manifest;
    }

    // toolchain version

    pub fn exec_path(&self) -> Option<PathBuf> {
        self.version.read().exec_path.clone()
    }

    pub fn version(&self) -> Option<Version> {
        self.version.read().version.clone()
    }

    pub fn provider_versions(&self) -> HashMap<String, Version> {
        self.version.read().provider_versions.clone()
    }

    pub fn version_state(&self) -> OpState {
        self.version.read().state
    }

    pub fn version_error(&self) -> Option<EngineError> {
        self.version.read().error.clone()
    }

    pub(crate) fn set_version_info(&self, exec_path: PathBuf, info: VersionInfo) {
        let mut slot = self.version.write();
        slot.exec_path = Some(exec_path);
        slot.version = Some(info.version);
        slot.provider_versions = info.provider_versions;
    }

    // provider schemas

    pub fn provider_schemas(&self) -> Option<ProviderSchemas> {
        self.schema.read().schemas.clone()
    }

    pub fn schema_state(&self) -> OpState {
        self.schema.read().state
    }

    pub fn schema_error(&self) -> Option<EngineError> {
        self.schema.read().error.clone()
    }

    pub(crate) fn set_provider_schemas(&self, schemas: ProviderSchemas) {
        self.schema.write().schemas = Some(schemas);
    }

    // slot state machine

    pub fn op_state(&self, kind: OpKind) -> OpState {
        match kind {
            OpKind::ParseConfiguration => self.parser_state(),
            OpKind::ParseModuleManifest => self.manifest_state(),
            OpKind::GetVersion => self.version_state(),
            OpKind::ObtainSchema => self.schema_state(),
        }
    }

    pub fn op_error(&self, kind: OpKind) -> Option<EngineError> {
        match kind {
            OpKind::ParseConfiguration => self.parser_error(),
            OpKind::ParseModuleManifest => self.manifest_error(),
            OpKind::GetVersion => self.version_error(),
            OpKind::ObtainSchema => self.schema_error(),
        }
    }

    fn with_slot<R>(&self, kind: OpKind, f: impl FnOnce(&mut OpState) -> R) -> R {
        match kind {
            OpKind::ParseConfiguration => f(&mut self.parser.write().state),
            OpKind::ParseModuleManifest => f(&mut self.manifest.write().state),
            OpKind::GetVersion => f(&mut self.version.write().state),
            OpKind::ObtainSchema => f(&mut self.schema.write().state),
        }
    }

    fn set_error(&self, kind: OpKind, error: Option<EngineError>) {
        match kind {
            OpKind::ParseConfiguration => self.parser.write().error = error,
            OpKind::ParseModuleManifest => self.manifest.write().error = error,
            OpKind::GetVersion => self.version.write().error = error,
            OpKind::ObtainSchema => self.schema.write().error = error,
        }
    }

    /// Mark the slot queued. Returns false when it was already queued, in
    /// which case the caller must not push a duplicate queue entry.
    pub(crate) fn mark_queued(&self, kind: OpKind) -> bool {
        self.with_slot(kind, |state| {
            if *state == OpState::Queued {
                false
            } else {
                *state = OpState::Queued;
                true
            }
        })
    }

    /// Start gate: move Queued to Loading. Returns false when the slot is
    /// not queued (the entry was cancelled or superseded) and the operation
    /// must not run.
    pub(crate) fn try_begin(&self, kind: OpKind) -> bool {
        self.with_slot(kind, |state| {
            if *state == OpState::Queued {
                *state = OpState::Loading;
                true
            } else {
                false
            }
        })
    }

    /// Finish an operation, storing its error (or clearing it on success).
    ///
    /// Loaded is only entered from Loading. If a re-enqueue raced the
    /// running operation the slot is already Queued again, and it stays
    /// Queued so the pending entry passes its start gate.
    pub(crate) fn complete(&self, kind: OpKind, error: Option<EngineError>) {
        self.set_error(kind, error);
        self.with_slot(kind, |state| {
            if *state == OpState::Loading {
                *state = OpState::Loaded;
            }
        });
    }

    /// Cancellation path: a discarded pending entry resets its slot so a
    /// later enqueue starts fresh.
    pub(crate) fn reset_if_queued(&self, kind: OpKind) {
        self.with_slot(kind, |state| {
            if *state == OpState::Queued {
                *state = OpState::Unknown;
            }
        });
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("parser", &self.parser_state())
            .field("manifest", &self.manifest_state())
            .field("version", &self.version_state())
            .field("schema", &self.schema_state())
            .finish()
    }
}
