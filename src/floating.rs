//! Objects under construction.
//!
//! A wrapper is floating from the moment its native handle is opened until the
//! constructor that opened it returns. The registry only holds weak
//! references: an object abandoned mid-construction is released by its own
//! drop path, and whatever is still alive when the owning context goes away is
//! force-closed by the sweep.

use std::collections::BTreeMap;
use std::sync::Weak;

use crate::object::{Object, ObjectInner};

/// Floating objects of one context, keyed by wrapper serial so sweeps run in
/// creation order.
#[derive(Default)]
pub(crate) struct FloatingRegistry {
    objects: BTreeMap<u64, Weak<ObjectInner>>,
}

impl FloatingRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns false when the object was already registered.
    pub(crate) fn register(&mut self, object: &Object) -> bool {
        if self.objects.contains_key(&object.serial()) {
            return false;
        }
        self.objects.insert(object.serial(), object.downgrade());
        true
    }

    pub(crate) fn unregister(&mut self, serial: u64) -> bool {
        self.objects.remove(&serial).is_some()
    }

    pub(crate) fn contains(&self, serial: u64) -> bool {
        self.objects.contains_key(&serial)
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Entries whose wrapper is still alive. The others are mid-drop and
    /// release themselves.
    pub(crate) fn into_objects(self) -> impl Iterator<Item = Object> {
        self.objects
            .into_values()
            .filter_map(|weak| weak.upgrade())
            .map(Object::from_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextOptions;
    use crate::context::Context;
    use crate::kind::TableKind;
    use crate::native::MemoryEngine;
    use crate::options::ObjectOptions;
    use crate::shutdown::ShutdownCoordinator;
    use std::sync::Arc;

    #[test]
    fn test_registry_does_not_keep_objects_alive() {
        let context = Context::new(
            Arc::new(MemoryEngine::new()),
            ShutdownCoordinator::new(),
            ContextOptions::default(),
        )
        .unwrap();
        let options = ObjectOptions::table(TableKind::Hash).key_type("ShortText");
        let kept = Object::open(&context, &options).unwrap();
        let abandoned = Object::open(&context, &options).unwrap();

        let mut registry = FloatingRegistry::new();
        assert!(registry.register(&kept));
        assert!(registry.register(&abandoned));
        assert!(!registry.register(&kept));
        drop(abandoned);

        assert_eq!(registry.len(), 2);
        let alive: Vec<Object> = registry.into_objects().collect();
        assert_eq!(alive.len(), 1);
        assert!(alive[0].ptr_eq(&kept));
    }
}
