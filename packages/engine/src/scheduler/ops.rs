//! Operation bodies executed by scheduler workers.
//!
//! Results land on the module's slots; errors are stored there too and
//! never propagate into the dispatch loop.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    datadir,
    error::{EngineError, Result},
    exec::{DiscoveryFn, ExecutorFactory, ExecutorOpts, ToolchainExecutor},
    module::{Module, OpKind},
    scheduler::queue::Operation,
    syntax::{ConfigParser, is_ignored_file},
    vfs::Filesystem,
};

/// Everything an operation body needs besides the module itself.
#[derive(Clone)]
pub struct OpContext {
    pub fs: Filesystem,
    pub parser: Arc<dyn ConfigParser>,
    pub executor_factory: ExecutorFactory,
    pub executor_opts: ExecutorOpts,
    pub discover: DiscoveryFn,
}

/// Run one dispatched operation to completion, honoring the start gate and
/// recording the outcome on the module.
pub(crate) async fn execute(ctx: &OpContext, op: &Operation, cancel: CancellationToken) {
    let module = &op.module;
    if !module.try_begin(op.kind) {
        // the pending entry was cancelled or superseded
        debug!(module = %module.path(), kind = %op.kind, "skipping stale operation");
        return;
    }

    let result = match op.kind {
        OpKind::ParseConfiguration => parse_configuration(ctx, module, &cancel).await,
        OpKind::ParseModuleManifest => parse_module_manifest(ctx, module).await,
        OpKind::GetVersion => get_version(ctx, module, &cancel).await,
        OpKind::ObtainSchema => obtain_schema(ctx, module, &cancel).await,
    };

    if let Err(err) = &result {
        warn!(module = %module.path(), kind = %op.kind, %err, "operation failed");
    }
    module.complete(op.kind, result.err());
}

/// Read and parse every configuration file directly inside the module
/// directory, replacing the previous parse wholesale.
#[instrument(name = "ops::parse_configuration", skip_all, fields(module = %module.path()))]
async fn parse_configuration(
    ctx: &OpContext,
    module: &Module,
    cancel: &CancellationToken,
) -> Result<()> {
    let entries = ctx.fs.read_dir(module.path().as_path()).await?;

    let mut files = HashMap::new();
    let mut diagnostics = HashMap::new();
    for entry in entries {
        if entry.is_dir {
            continue;
        }
        let name = entry.name;
        if !name.ends_with(".tf") || is_ignored_file(&name) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let path = module.path().join(&name);
        let src = ctx.fs.read_file(&path).await?;
        let (file, diags) = ctx.parser.parse(&src, &name);
        diagnostics.insert(name.clone(), diags);
        if let Some(file) = file {
            files.insert(name, file);
        }
    }

    debug!(files = files.len(), "parsed configuration");
    module.set_parsed_config(files, diagnostics);
    Ok(())
}

/// Parse the installed-modules manifest. A missing manifest is normal for
/// uninitialized modules and clears any previously loaded one.
#[instrument(name = "ops::parse_module_manifest", skip_all, fields(module = %module.path()))]
async fn parse_module_manifest(ctx: &OpContext, module: &Module) -> Result<()> {
    match datadir::parse_installed_modules(&ctx.fs, module.path().as_path()).await {
        Ok(manifest) => {
            info!(records = manifest.records().len(), "updated module manifest");
            module.set_manifest(Some(Arc::new(manifest)));
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            info!("no module manifest");
            module.set_manifest(None);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Resolve the executor binary for a module: a previously stored path, the
/// engine-wide override, or discovery on `PATH`.
fn resolve_exec_path(ctx: &OpContext, module: &Module) -> Result<PathBuf> {
    if let Some(path) = module.exec_path() {
        return Ok(path);
    }
    if let Some(path) = &ctx.executor_opts.exec_path {
        return Ok(path.clone());
    }
    (ctx.discover)()
}

fn executor_for(ctx: &OpContext, module: &Module, exec_path: &Path) -> Arc<dyn ToolchainExecutor> {
    (ctx.executor_factory)(module.path().as_path(), exec_path, &ctx.executor_opts)
}

/// Query the toolchain for its version and the selected provider versions.
#[instrument(name = "ops::get_version", skip_all, fields(module = %module.path()))]
async fn get_version(ctx: &OpContext, module: &Module, cancel: &CancellationToken) -> Result<()> {
    let exec_path = resolve_exec_path(ctx, module)?;
    let executor = executor_for(ctx, module, &exec_path);

    let info = tokio::select! {
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        info = executor.version() => info?,
    };

    info!(version = %info.version, "toolchain version found");
    module.set_version_info(exec_path, info);
    Ok(())
}

/// Dump provider schemas for the module.
#[instrument(name = "ops::obtain_schema", skip_all, fields(module = %module.path()))]
async fn obtain_schema(ctx: &OpContext, module: &Module, cancel: &CancellationToken) -> Result<()> {
    let exec_path = resolve_exec_path(ctx, module)?;
    let executor = executor_for(ctx, module, &exec_path);

    let schemas = tokio::select! {
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        schemas = executor.provider_schemas() => schemas?,
    };

    module.set_provider_schemas(schemas);
    Ok(())
}
