//! The prioritized operation scheduler.
//!
//! A single dispatch loop owns the decision of what runs next; workers run
//! operations to completion and wake the loop when they finish. Capacity is
//! split into two classes: a slice reserved for modules the user is editing
//! and a general slice anyone may use. The reserved slice keeps the editor
//! responsive under load, the general slice bounds total concurrency and
//! guarantees background modules still make progress.

pub mod ops;
pub mod queue;

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace};

pub use crate::module::{OpKind, OpState};
use crate::module::Module;
pub use ops::OpContext;
use queue::{Operation, OpsQueue};

/// Worker-pool sizing for the two dispatch classes.
#[derive(Copy, Clone, Debug)]
pub struct Parallelism {
    /// Slots reserved for modules with open files.
    pub prio: usize,
    /// General slots, usable by any module.
    pub non_prio: usize,
}

impl Default for Parallelism {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            prio: cpus,
            non_prio: 2 * cpus,
        }
    }
}

struct SchedulerInner {
    ctx: OpContext,
    queue: OpsQueue,
    wakeup: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
    prio_parallelism: i64,
    non_prio_parallelism: i64,
    in_flight_prio: AtomicI64,
    in_flight_non_prio: AtomicI64,
}

/// Handle to the running scheduler. Cloneable; all clones share the same
/// queue and worker pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    dispatch_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Start the dispatch loop and return a handle to it. Normally called
    /// by the engine during construction; must run inside a tokio runtime.
    pub fn spawn(ctx: OpContext, parallelism: Parallelism, cancel: CancellationToken) -> Self {
        let inner = Arc::new(SchedulerInner {
            ctx,
            queue: OpsQueue::new(),
            wakeup: Notify::new(),
            cancel,
            tracker: TaskTracker::new(),
            prio_parallelism: parallelism.prio as i64,
            non_prio_parallelism: parallelism.non_prio as i64,
            in_flight_prio: AtomicI64::new(0),
            in_flight_non_prio: AtomicI64::new(0),
        });

        let dispatch_task = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self {
            inner,
            dispatch_task: Arc::new(Mutex::new(Some(dispatch_task))),
        }
    }

    /// Queue an operation for a module.
    ///
    /// If the module's slot for this kind is already queued the call is a
    /// no-op, so at most one entry per (module, kind) waits at a time.
    pub fn enqueue(&self, module: Arc<Module>, kind: OpKind) {
        if !module.mark_queued(kind) {
            trace!(module = %module.path(), %kind, "dropping duplicate enqueue");
            return;
        }
        debug!(module = %module.path(), %kind, "enqueue operation");
        self.inner.queue.push(Operation::new(module, kind));
        self.inner.wakeup.notify_one();
    }

    /// Number of operations waiting for dispatch.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stop dispatching, discard pending operations, and wait for in-flight
    /// workers to drain.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.wakeup.notify_one();

        let dispatch_task = self.dispatch_task.lock().take();
        if let Some(task) = dispatch_task {
            let _ = task.await;
        }

        self.inner.tracker.wait().await;
    }
}

async fn dispatch_loop(inner: Arc<SchedulerInner>) {
    debug!(
        prio = inner.prio_parallelism,
        non_prio = inner.non_prio_parallelism,
        "scheduler dispatch loop running"
    );

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let prio_capacity =
            inner.prio_parallelism - inner.in_flight_prio.load(Ordering::SeqCst);
        let non_prio_capacity =
            inner.non_prio_parallelism - inner.in_flight_non_prio.load(Ordering::SeqCst);

        if inner.queue.is_empty() || prio_capacity + non_prio_capacity <= 0 {
            wait_for_wakeup(&inner).await;
            continue;
        }

        let Some(head) = inner.queue.peek() else {
            continue;
        };

        if head.module.has_open_files() && prio_capacity > 0 {
            dispatch(&inner, Class::Prio);
        } else if non_prio_capacity > 0 {
            dispatch(&inner, Class::NonPrio);
        } else {
            wait_for_wakeup(&inner).await;
        }
    }

    // discard pending work so a future enqueue starts from a clean slot
    for op in inner.queue.drain() {
        op.module.reset_if_queued(op.kind);
    }
    inner.tracker.close();
    debug!("scheduler dispatch loop stopped");
}

async fn wait_for_wakeup(inner: &SchedulerInner) {
    tokio::select! {
        _ = inner.wakeup.notified() => {}
        _ = inner.cancel.cancelled() => {}
    }
}

#[derive(Copy, Clone)]
enum Class {
    Prio,
    NonPrio,
}

fn dispatch(inner: &Arc<SchedulerInner>, class: Class) {
    let Some(op) = inner.queue.pop() else {
        return;
    };

    let counter = match class {
        Class::Prio => &inner.in_flight_prio,
        Class::NonPrio => &inner.in_flight_non_prio,
    };
    counter.fetch_add(1, Ordering::SeqCst);
    trace!(module = %op.module.path(), kind = %op.kind, "dispatch operation");

    let inner = Arc::clone(inner);
    let _ = inner.tracker.clone().spawn(async move {
        let cancel = inner.cancel.child_token();
        ops::execute(&inner.ctx, &op, cancel).await;

        let counter = match class {
            Class::Prio => &inner.in_flight_prio,
            Class::NonPrio => &inner.in_flight_non_prio,
        };
        counter.fetch_sub(1, Ordering::SeqCst);
        inner.wakeup.notify_one();
    });
}
