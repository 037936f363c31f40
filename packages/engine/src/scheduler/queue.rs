//! The pending-operations queue.
//!
//! A single priority axis: operations for modules the user has open files
//! in come first. Ties preserve insertion order, so within a priority class
//! the queue is FIFO. Priority is evaluated at pop time because buffers
//! open and close while operations wait.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::module::{Module, OpKind};

/// One unit of scheduled work.
#[derive(Clone)]
pub struct Operation {
    pub module: Arc<Module>,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(module: Arc<Module>, kind: OpKind) -> Self {
        Self { module, kind }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation({}, {})", self.module.path(), self.kind)
    }
}

/// Thread-safe priority queue of pending operations.
#[derive(Default)]
pub struct OpsQueue {
    items: Mutex<VecDeque<Operation>>,
}

impl OpsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn push(&self, op: Operation) {
        self.items.lock().push_back(op);
    }

    /// Remove and return the highest-priority operation: the oldest entry
    /// whose module has open files, else the oldest entry overall.
    pub fn pop(&self) -> Option<Operation> {
        let mut items = self.items.lock();
        let index = items
            .iter()
            .position(|op| op.module.has_open_files())
            .unwrap_or(0);
        items.remove(index)
    }

    /// The operation [`OpsQueue::pop`] would return, without removing it.
    pub fn peek(&self) -> Option<Operation> {
        let items = self.items.lock();
        items
            .iter()
            .find(|op| op.module.has_open_files())
            .or_else(|| items.front())
            .cloned()
    }

    /// Drain every pending operation, oldest first.
    pub fn drain(&self) -> Vec<Operation> {
        self.items.lock().drain(..).collect()
    }
}
