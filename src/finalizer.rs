//! Finalizer bridge.
//!
//! A bound wrapper can be released from two directions:
//!
//! - native to managed: the engine releases the handle on its own (context
//!   teardown, unlink reaching zero) and calls the finalizer installed at bind
//!   time with the handle's user data;
//! - managed to native: the last reference to the wrapper goes away
//!   (`Drop for ObjectInner`) while it is still bound.
//!
//! Whichever path runs first unbinds the wrapper; the other one then finds
//! nothing to do. Exactly one teardown runs per binding and neither path ever
//! returns an error.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::context::{Context, ContextInner};
use crate::kind::{ColumnKind, ObjectKind};
use crate::native::{FinalizeEvent, Finalizer, HandleId, RecordId, UserData};
use crate::object::{Object, ObjectInner};

/// Wrapper-side state owned by a bound object, by kind.
#[derive(Debug, Default)]
pub(crate) enum Resources {
    #[default]
    None,
    /// Encoded key of the last table operation
    Table { key_buffer: Vec<u8> },
    /// Normalized query and result scratch of an index column
    IndexColumn {
        query: String,
        postings: Vec<RecordId>,
    },
    /// The database is the one associated with its context
    Database,
    Expression { terms: Vec<String> },
}

impl Resources {
    pub(crate) fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Table(_) => Resources::Table {
                key_buffer: Vec::new(),
            },
            ObjectKind::Column(ColumnKind::Index) => Resources::IndexColumn {
                query: String::new(),
                postings: Vec::new(),
            },
            ObjectKind::Database => Resources::Database,
            ObjectKind::Expression => Resources::Expression { terms: Vec::new() },
            ObjectKind::Column(ColumnKind::Fixed)
            | ObjectKind::Column(ColumnKind::Variable)
            | ObjectKind::Type
            | ObjectKind::Procedure
            | ObjectKind::Accessor
            | ObjectKind::Cursor
            | ObjectKind::Snippet => Resources::None,
        }
    }

    fn retained_bytes(&self) -> usize {
        match self {
            Resources::None | Resources::Database => 0,
            Resources::Table { key_buffer } => key_buffer.capacity(),
            Resources::IndexColumn { query, postings } => {
                query.capacity() + postings.capacity() * std::mem::size_of::<RecordId>()
            }
            Resources::Expression { terms } => terms.iter().map(String::capacity).sum(),
        }
    }
}

/// Kind-specific managed teardown.
pub(crate) fn teardown(kind: ObjectKind, handle: HandleId, resources: Resources, context: &Context) {
    let retained = resources.retained_bytes();
    match resources {
        Resources::Database => {
            if !context.options().per_db {
                context.detach_database(handle);
            }
        }
        Resources::Table { .. }
        | Resources::IndexColumn { .. }
        | Resources::Expression { .. }
        | Resources::None => {}
    }
    context.stats().record_teardown();
    trace!("Teardown of {} {}: released {} bytes", kind, handle, retained);
}

/// Handle to wrapper map of one context.
///
/// Handle ids are engine-wide, so the map is sparse. The serial stored next
/// to each entry is the user data written into the handle at bind time; a
/// finalizer event whose user data does not match belongs to an earlier
/// binding of the same handle.
#[derive(Default)]
pub(crate) struct WrapperTable {
    entries: AHashMap<HandleId, (u64, Weak<ObjectInner>)>,
}

impl WrapperTable {
    pub(crate) fn insert(&mut self, handle: HandleId, serial: u64, object: Weak<ObjectInner>) {
        self.entries.insert(handle, (serial, object));
    }

    pub(crate) fn get(&self, handle: HandleId) -> Option<(u64, Weak<ObjectInner>)> {
        self.entries.get(&handle).cloned()
    }

    /// The live wrapper bound to `handle`, if any.
    pub(crate) fn object(&self, handle: HandleId) -> Option<Object> {
        let (_, weak) = self.get(handle)?;
        weak.upgrade().map(Object::from_inner)
    }

    /// Removes the entry only if it still belongs to `serial`.
    pub(crate) fn remove(&mut self, handle: HandleId, serial: u64) -> bool {
        match self.entries.get(&handle) {
            Some((owner, _)) if *owner == serial => {
                self.entries.remove(&handle);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// The callback handed to the engine for every handle bound in a context.
pub(crate) fn native_finalizer(context: Weak<ContextInner>) -> Finalizer {
    Arc::new(move |event: FinalizeEvent| {
        if let Some(inner) = context.upgrade() {
            on_native_finalize(&Context::from_inner(inner), event);
        }
    })
}

/// Native to managed path.
fn on_native_finalize(context: &Context, event: FinalizeEvent) {
    let entry = context.wrappers().lock().get(event.handle);
    let (serial, weak) = match entry {
        Some(entry) => entry,
        None => return,
    };
    if event.user_data != Some(UserData(serial)) {
        debug!("Ignoring finalizer for stale binding of {}", event.handle);
        return;
    }
    // A failed upgrade means the wrapper is being dropped right now and its
    // own drop path already took the binding.
    let object = match weak.upgrade() {
        Some(inner) => Object::from_inner(inner),
        None => return,
    };
    object.finalize_from_native();
}
