//! The engine command surface.
//!
//! This is the typed interface the RPC layer drives: register a directory,
//! look modules up, queue refreshes, shut down. Everything else happens
//! asynchronously behind it. Must be constructed inside a tokio runtime;
//! construction spawns the scheduler dispatch loop and the watcher loop.

use std::{path::Path, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
    datadir,
    error::Result,
    exec::{DiscoveryFn, ExecutorFactory, ExecutorOpts, default_executor_factory, discover},
    module::{Module, OpKind},
    path::ModulePath,
    registry::ModuleRegistry,
    scheduler::{OpContext, Parallelism, Scheduler},
    syntax::ConfigParser,
    vfs::Filesystem,
    watcher::ModuleWatcher,
};

/// Tunables for engine construction.
#[derive(Clone)]
pub struct EngineOptions {
    /// Options applied to every toolchain executor.
    pub executor: ExecutorOpts,
    /// Worker-pool sizing. Defaults scale with the CPU count.
    pub parallelism: Parallelism,
    /// Executor constructor; tests substitute mocks here.
    pub executor_factory: ExecutorFactory,
    /// Toolchain binary locator.
    pub discover: DiscoveryFn,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorOpts::default(),
            parallelism: Parallelism::default(),
            executor_factory: default_executor_factory(),
            discover: Arc::new(discover),
        }
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("executor", &self.executor)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// The module-state engine: registry, scheduler, and watcher wired together.
pub struct Engine {
    fs: Filesystem,
    registry: Arc<ModuleRegistry>,
    scheduler: Scheduler,
    watcher: ModuleWatcher,
    cancel: CancellationToken,
}

impl Engine {
    /// Build the engine and start its background loops.
    pub fn new(
        fs: Filesystem,
        parser: Arc<dyn ConfigParser>,
        opts: EngineOptions,
    ) -> Result<Self> {
        let registry = Arc::new(ModuleRegistry::new(fs.clone()));
        let cancel = CancellationToken::new();

        let ctx = OpContext {
            fs: fs.clone(),
            parser,
            executor_factory: opts.executor_factory,
            executor_opts: opts.executor,
            discover: opts.discover,
        };
        let scheduler = Scheduler::spawn(ctx, opts.parallelism, cancel.child_token());

        let watcher = ModuleWatcher::new(Arc::clone(&registry), scheduler.clone())?;
        watcher.start();

        Ok(Self {
            fs,
            registry,
            scheduler,
            watcher,
            cancel,
        })
    }

    /// The virtual filesystem the engine reads through. The LSP document
    /// lifecycle (open, change, close) is driven against this handle.
    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    /// Register a module directory: create its record, start watching its
    /// paths, and queue the four bootstrap operations.
    #[instrument(name = "Engine::register", skip(self))]
    pub async fn register(&self, path: &Path) -> Result<Arc<Module>> {
        let module = self.registry.add(ModulePath::new(path))?;

        let summary = datadir::walk_data_dir(&self.fs, module.path().as_path()).await;
        debug!(?summary, "walked datadir");
        self.watcher.add_module(&module, &summary).await;

        for kind in OpKind::ALL {
            self.scheduler.enqueue(Arc::clone(&module), kind);
        }

        info!(module = %module.path(), "module registered");
        Ok(module)
    }

    /// Look up the module registered at `path`.
    pub fn lookup(&self, path: &Path) -> Result<Arc<Module>> {
        self.registry.by_path(path)
    }

    /// Snapshot of all registered modules.
    pub fn list_modules(&self) -> Vec<Arc<Module>> {
        self.registry.list()
    }

    /// Queue a refresh of one state slot for the module at `path`.
    pub fn enqueue_operation(&self, path: &Path, kind: OpKind) -> Result<()> {
        let module = self.registry.by_path(path)?;
        self.scheduler.enqueue(module, kind);
        Ok(())
    }

    /// Stop the watcher, discard pending operations, and drain in-flight
    /// workers.
    #[instrument(name = "Engine::shutdown", skip_all)]
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.watcher.stop().await;
        self.scheduler.shutdown().await;
        info!("engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("modules", &self.registry.list().len())
            .field("queued", &self.scheduler.queue_len())
            .finish()
    }
}
