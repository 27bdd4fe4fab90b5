//! Process teardown coordination.
//!
//! Once the process has started tearing down, the engine may already be gone.
//! Every context gets a handle to the same coordinator at construction and asks
//! it before each native call on a teardown path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::{Context, ContextInner};

pub struct ShutdownCoordinator {
    exited: AtomicBool,
    contexts: Mutex<Vec<Weak<ContextInner>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            exited: AtomicBool::new(false),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Flips the flag. Returns true only for the call that flipped it.
    pub fn mark_exited(&self) -> bool {
        !self.exited.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn track(&self, context: &Arc<ContextInner>) {
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(Arc::downgrade(context));
    }

    /// Contexts that are still referenced somewhere.
    pub fn live_contexts(&self) -> Vec<Context> {
        self.contexts
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(Context::from_inner)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_exited_flips_once() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_exited());
        assert!(coordinator.mark_exited());
        assert!(!coordinator.mark_exited());
        assert!(coordinator.is_exited());
    }
}
