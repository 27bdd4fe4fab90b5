//! Wrapper objects.
//!
//! An `Object` pairs a context with one native handle and forwards calls to the
//! engine. The pairing is the binding; it is created by `bind`, and taken
//! exactly once by whichever of `close`, `unlink`, the native finalizer or
//! `Drop` gets there first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::finalizer::{self, Resources};
use crate::kind::ObjectKind;
use crate::native::{HandleId, HandleInfo, NativeContextId, ReturnCode, UserData};
use crate::options::ObjectOptions;

// Serials double as the user data written into each bound handle, so they
// are never reused.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

struct Binding {
    context: Context,
    handle: HandleId,
}

struct ObjectState {
    binding: Option<Binding>,
    kind: ObjectKind,
    name: Option<String>,
    persistent: bool,
    floating: bool,
    need_close: bool,
    have_finalizer: bool,
    domain: Option<HandleId>,
    range: Option<HandleId>,
    resources: Resources,
    /// Wrappers the open request referred to (key type, source table).
    referents: Vec<Object>,
}

/// Everything the release paths need once the binding is gone.
struct Released {
    context: Context,
    handle: HandleId,
    kind: ObjectKind,
    resources: Resources,
    need_close: bool,
    have_finalizer: bool,
    was_floating: bool,
    referents: Vec<Object>,
}

impl ObjectState {
    fn unbound(kind: ObjectKind) -> Self {
        Self {
            binding: None,
            kind,
            name: None,
            persistent: false,
            floating: false,
            need_close: false,
            have_finalizer: false,
            domain: None,
            range: None,
            resources: Resources::None,
            referents: Vec::new(),
        }
    }

    fn release(&mut self) -> Option<Released> {
        let binding = self.binding.take()?;
        Some(Released {
            context: binding.context,
            handle: binding.handle,
            kind: self.kind,
            resources: std::mem::take(&mut self.resources),
            need_close: self.need_close,
            have_finalizer: self.have_finalizer,
            was_floating: std::mem::replace(&mut self.floating, false),
            referents: std::mem::take(&mut self.referents),
        })
    }
}

pub(crate) struct ObjectInner {
    serial: u64,
    state: Mutex<ObjectState>,
}

/// Managed wrapper around one native handle. Clones share the same binding.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    pub(crate) fn from_inner(inner: Arc<ObjectInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ObjectInner> {
        Arc::downgrade(&self.inner)
    }

    fn unbound(kind: ObjectKind) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                serial: next_serial(),
                state: Mutex::new(ObjectState::unbound(kind)),
            }),
        }
    }

    /// Opens a new native object and binds a wrapper to it.
    ///
    /// The wrapper is returned floating until `complete`. Dropping it before
    /// then releases it, and closing the context sweeps whatever is still
    /// held. `Context::open_object` handles both outcomes.
    pub fn open(context: &Context, options: &ObjectOptions) -> Result<Object> {
        options.validate()?;
        let native = context.live_native()?;
        context.reserve_floating()?;

        let (request, referents) = options.to_request(context)?;
        let opened = context.engine().handle_open(native, &request);
        let handle = context.check(opened, None)?;

        // Opening an existing object can hand back a handle that already has
        // a wrapper; that one is fully constructed and is returned as is.
        let existing = context.wrappers().lock().object(handle);
        if let Some(object) = existing {
            context.release_extra_reference(native, &object);
            return Ok(object);
        }

        let object = match Object::bind(context, handle) {
            Ok(object) => object,
            Err(e) => {
                if let Err(close_error) = context.close_handle(handle, None) {
                    warn!("Failed to release {} after bind error: {}", handle, close_error);
                }
                return Err(e);
            }
        };
        object.inner.state.lock().referents = referents;
        context.register_floating(&object);
        debug!("Opened {}", object.describe());
        Ok(object)
    }

    /// Binds a fresh wrapper to an existing handle. Callers go through
    /// `Context::wrap` so a handle never has two live wrappers.
    pub(crate) fn bind(context: &Context, handle: HandleId) -> Result<Object> {
        let info = handle_info(context, context.live_native()?, handle)?;
        let kind = ObjectKind::from_tag(info.type_tag)?;

        let object = Object::unbound(kind);
        object.attach(context, handle, kind, info)?;
        Ok(object)
    }

    fn attach(&self, context: &Context, handle: HandleId, kind: ObjectKind, info: HandleInfo) -> Result<()> {
        let native = context.live_native()?;
        let engine = context.engine();

        let need_close = kind.need_close();
        let mut have_finalizer = kind.implicit_finalizer();
        if need_close {
            let stored = engine.set_user_data(native, handle, UserData(self.inner.serial));
            context.check(stored, None)?;
            if engine.set_finalizer(native, handle, context.finalizer()) {
                have_finalizer = true;
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.binding = Some(Binding {
                context: context.clone(),
                handle,
            });
            state.kind = kind;
            state.name = info.name;
            state.persistent = info.flags.persistent;
            state.need_close = need_close;
            state.have_finalizer = have_finalizer;
            state.domain = info.domain;
            state.range = info.range;
            state.resources = Resources::for_kind(kind);
        }

        context
            .wrappers()
            .lock()
            .insert(handle, self.inner.serial, self.downgrade());
        context.stats().record_bound();
        Ok(())
    }

    /// Ends construction: the object no longer needs the context's sweep.
    pub fn complete(&self) {
        if let Some(context) = self.context() {
            context.unregister_floating(self);
        }
    }

    /// Releases the binding. A second call is a no-op.
    pub fn close(&self) -> Result<()> {
        let released = match self.inner.state.lock().release() {
            Some(released) => released,
            None => return Ok(()),
        };
        let context = released.context.clone();
        let handle = released.handle;
        let need_close = released.need_close;

        self.finish_release(released);
        context.stats().record_closed();
        debug!("Closed {} {}", self.kind(), handle);

        if need_close {
            context.close_handle(handle, Some(self))?;
        }
        Ok(())
    }

    /// Drops one native reference.
    ///
    /// A persistent object stays bound; a temporary one is released the same
    /// way `close` releases it and the engine frees the handle.
    pub fn unlink(&self) -> Result<()> {
        let (context, native, handle) = self.live()?;
        if self.is_persistent() {
            context.engine().handle_unlink(native, handle);
            return context.check_error(Some(self));
        }

        let released = match self.inner.state.lock().release() {
            Some(released) => released,
            None => return Ok(()),
        };
        self.finish_release(released);
        context.stats().record_closed();

        context.engine().handle_unlink(native, handle);
        context.check_error(Some(self))
    }

    /// Unregisters a released binding and runs the managed teardown.
    fn finish_release(&self, released: Released) {
        let Released {
            context,
            handle,
            kind,
            resources,
            have_finalizer,
            was_floating,
            ..
        } = released;

        if was_floating {
            context.unregister_floating_serial(self.inner.serial);
        }
        context.wrappers().lock().remove(handle, self.inner.serial);
        if have_finalizer {
            finalizer::teardown(kind, handle, resources, &context);
        }
    }

    /// Native side released the handle first.
    pub(crate) fn finalize_from_native(&self) {
        let released = match self.inner.state.lock().release() {
            Some(released) => released,
            None => return,
        };
        let context = released.context.clone();
        let handle = released.handle;
        self.finish_release(released);
        context.stats().record_native_finalized();
        debug!("Engine finalized {} {}", self.kind(), handle);
    }

    /// Rebinds a wrapper that is still under construction to another handle.
    pub fn rebind(&self, handle: HandleId) -> Result<()> {
        let context = match self.context() {
            Some(context) => context,
            None => return Err(Error::ClosedResource(self.describe())),
        };
        if !self.is_floating() {
            return Err(Error::InvalidArgument(format!(
                "{} is fully constructed and cannot be rebound",
                self.describe()
            )));
        }
        let existing = context.wrappers().lock().object(handle);
        if existing.is_some() {
            return Err(Error::InvalidArgument(format!("{} is already bound", handle)));
        }

        let info = handle_info(&context, context.live_native()?, handle)?;
        let kind = ObjectKind::from_tag(info.type_tag)?;

        // The old handle is released like a close, but the wrapper stays
        // registered as floating until construction completes.
        self.close()?;
        context.register_floating(self);
        self.attach(&context, handle, kind, info)
    }

    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        match &state.binding {
            Some(binding) => binding.context.native_id().is_none(),
            None => true,
        }
    }

    /// Key type of a table, or the table owning a column.
    pub fn domain(&self) -> Result<Option<Object>> {
        let (context, _, _) = self.live()?;
        let domain = self.inner.state.lock().domain;
        domain.map(|handle| context.wrap(handle)).transpose()
    }

    /// Value type of a column or table.
    pub fn range(&self) -> Result<Option<Object>> {
        let (context, _, _) = self.live()?;
        let range = self.inner.state.lock().range;
        range.map(|handle| context.wrap(handle)).transpose()
    }

    pub fn kind(&self) -> ObjectKind {
        self.inner.state.lock().kind
    }

    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().name.clone()
    }

    pub fn handle(&self) -> Option<HandleId> {
        self.inner.state.lock().binding.as_ref().map(|b| b.handle)
    }

    pub fn context(&self) -> Option<Context> {
        self.inner.state.lock().binding.as_ref().map(|b| b.context.clone())
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.state.lock().persistent
    }

    pub fn is_floating(&self) -> bool {
        self.inner.state.lock().floating
    }

    pub fn need_close(&self) -> bool {
        self.inner.state.lock().need_close
    }

    pub fn have_finalizer(&self) -> bool {
        self.inner.state.lock().have_finalizer
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub(crate) fn set_floating(&self, floating: bool) {
        self.inner.state.lock().floating = floating;
    }

    /// Context, native context and handle of a usable binding.
    pub(crate) fn live(&self) -> Result<(Context, NativeContextId, HandleId)> {
        let (context, handle) = {
            let state = self.inner.state.lock();
            match &state.binding {
                Some(binding) => (binding.context.clone(), binding.handle),
                None => return Err(Error::ClosedResource(describe_state(&state))),
            }
        };
        match context.native_id() {
            Some(native) => Ok((context, native, handle)),
            None => Err(Error::ClosedResource(self.describe())),
        }
    }

    /// Runs `f` on the kind-specific scratch state while holding the object lock.
    pub(crate) fn with_resources<R>(&self, f: impl FnOnce(&mut Resources) -> R) -> R {
        f(&mut self.inner.state.lock().resources)
    }

    /// Short human readable form, used in error messages.
    pub fn describe(&self) -> String {
        describe_state(&self.inner.state.lock())
    }
}

/// Engine description of `handle`. A handle the engine already released is a
/// closed resource; anything else it does not know is not an engine object.
fn handle_info(context: &Context, native: NativeContextId, handle: HandleId) -> Result<HandleInfo> {
    match context.engine().handle_info(native, handle) {
        Ok(info) => Ok(info),
        Err(ReturnCode::ObjectClosed) => Err(Error::ClosedResource(format!("handle {} was released", handle))),
        Err(_) => Err(Error::TypeMismatch {
            expected: "engine object".to_string(),
            actual: format!("unknown handle {}", handle),
        }),
    }
}

fn describe_state(state: &ObjectState) -> String {
    let name = state.name.as_deref().unwrap_or("(anonymous)");
    match &state.binding {
        Some(binding) => format!("#<{} {} handle={}>", state.kind, name, binding.handle),
        None => format!("#<{} {} closed>", state.kind, name),
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl Drop for ObjectInner {
    /// Managed to native path.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let released = match state.release() {
            Some(released) => released,
            None => return,
        };
        let Released {
            context,
            handle,
            kind,
            resources,
            need_close,
            have_finalizer,
            was_floating,
            referents,
        } = released;

        if was_floating {
            context.unregister_floating_serial(self.serial);
        }
        context.wrappers().lock().remove(handle, self.serial);
        if have_finalizer {
            finalizer::teardown(kind, handle, resources, &context);
        }
        if have_finalizer || need_close {
            context.stats().record_closed();
        }
        if need_close {
            if let Err(e) = context.close_handle(handle, None) {
                warn!("Failed to release {} {} on drop: {}", kind, handle, e);
            }
        }
        drop(referents);
    }
}
