//! Native context wrapper.
//!
//! A `Context` owns one native context id for its whole life. Every wrapper
//! bound in it keeps the context alive, and the context in turn tracks:
//!
//! - the floating registry (objects still under construction),
//! - the handle to wrapper side table the finalizer bridge resolves events
//!   against,
//! - the database currently associated with it.
//!
//! Closing is idempotent: sweep the floating registry, then release the native
//! context, unless the process has already torn the engine down.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{ContextOptions, Encoding};
use crate::error::{Error, Location, Result};
use crate::finalizer::{self, WrapperTable};
use crate::floating::FloatingRegistry;
use crate::native::{Finalizer, HandleId, LastError, NativeContextId, NativeEngine, NativeResult, ReturnCode};
use crate::object::Object;
use crate::objects::Database;
use crate::options::ObjectOptions;
use crate::shutdown::ShutdownCoordinator;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Lifecycle counters of one context (lock-free)
#[derive(Default)]
pub struct LifecycleStats {
    bound: AtomicU64,
    closed: AtomicU64,
    swept: AtomicU64,
    teardowns: AtomicU64,
    native_finalized: AtomicU64,
    native_closes: AtomicU64,
}

impl LifecycleStats {
    pub(crate) fn record_bound(&self) {
        self.bound.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_swept(&self) {
        self.swept.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_native_finalized(&self) {
        self.native_finalized.fetch_add(1, Ordering::Relaxed);
    }

    fn record_native_close(&self) {
        self.native_closes.fetch_add(1, Ordering::Relaxed);
    }

    /// Wrappers bound to a handle (including rebinds)
    pub fn get_bound(&self) -> u64 {
        self.bound.load(Ordering::Relaxed)
    }

    /// Bindings released by close, unlink or drop
    pub fn get_closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Floating objects force-closed by a context close
    pub fn get_swept(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    pub fn get_teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }

    /// Bindings released because the engine finalized the handle first
    pub fn get_native_finalized(&self) -> u64 {
        self.native_finalized.load(Ordering::Relaxed)
    }

    pub fn get_native_closes(&self) -> u64 {
        self.native_closes.load(Ordering::Relaxed)
    }
}

pub(crate) struct ContextInner {
    serial: u64,
    engine: Arc<dyn NativeEngine>,
    shutdown: Arc<ShutdownCoordinator>,
    options: ContextOptions,
    native: Mutex<Option<NativeContextId>>,
    closed: AtomicBool,
    floating: Mutex<Option<FloatingRegistry>>,
    wrappers: Mutex<WrapperTable>,
    database: Mutex<Option<HandleId>>,
    finalizer: Finalizer,
    stats: LifecycleStats,
}

/// Shared handle to a native context
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Initializes a native context on `engine`.
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        shutdown: Arc<ShutdownCoordinator>,
        options: ContextOptions,
    ) -> Result<Context> {
        if shutdown.is_exited() {
            return Err(Error::ClosedResource("process is exiting".to_string()));
        }
        let native = engine.context_init(&options).map_err(|rc| Error::NativeEngine {
            rc,
            message: "context initialization failed".to_string(),
            location: None,
            related: None,
        })?;

        let inner = Arc::new_cyclic(|weak: &Weak<ContextInner>| ContextInner {
            serial: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            engine,
            shutdown,
            options,
            native: Mutex::new(Some(native)),
            closed: AtomicBool::new(false),
            floating: Mutex::new(None),
            wrappers: Mutex::new(WrapperTable::default()),
            database: Mutex::new(None),
            finalizer: finalizer::native_finalizer(weak.clone()),
            stats: LifecycleStats::default(),
        });
        inner.shutdown.track(&inner);
        debug!("Context {} initialized ({:?})", inner.serial, native);
        Ok(Context { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.inner.engine
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.inner.shutdown
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.options.encoding
    }

    pub fn stats(&self) -> &LifecycleStats {
        &self.inner.stats
    }

    pub fn id(&self) -> u64 {
        self.inner.serial
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The native context id while it has not been released.
    pub fn native_id(&self) -> Option<NativeContextId> {
        *self.inner.native.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.native_id().is_none()
    }

    /// Native id for a forward call; fails once the context or the process
    /// is going away.
    pub(crate) fn live_native(&self) -> Result<NativeContextId> {
        if self.inner.shutdown.is_exited() {
            return Err(Error::ClosedResource("process is exiting".to_string()));
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedResource(format!("context {} is closed", self.inner.serial)));
        }
        self.native_id()
            .ok_or_else(|| Error::ClosedResource(format!("context {} is closed", self.inner.serial)))
    }

    /// Native id for a release path. None means the engine already let go
    /// of everything this context owned.
    fn teardown_native(&self) -> Option<NativeContextId> {
        if self.inner.shutdown.is_exited() {
            return None;
        }
        self.native_id()
    }

    /// Releases the native context. Calling it again does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let swept = self.sweep_floating();

        let native = self.inner.native.lock().take();
        if let Some(native) = native {
            if self.inner.shutdown.is_exited() {
                debug!("Context {} closed after exit; engine already finalized", self.inner.serial);
            } else {
                self.inner.engine.context_fin(native);
            }
        }
        debug!("Context {} closed ({} floating objects swept)", self.inner.serial, swept);
    }

    /// Converts the context's last error into an `Error`. A closed context
    /// has no last error to read and is reported as such.
    pub fn check_error(&self, related: Option<&Object>) -> Result<()> {
        let native = self.live_native()?;
        let last = self.inner.engine.context_last_error(native);
        if last.rc.is_success() {
            return Ok(());
        }
        let rc = last.rc;
        Err(native_error(rc, last, related))
    }

    /// Passes `result` through, turning a failure into an error carrying
    /// the context's last-error details.
    pub(crate) fn check<T>(&self, result: NativeResult<T>, related: Option<&Object>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(rc) => {
                let last = match self.native_id() {
                    Some(native) => self.inner.engine.context_last_error(native),
                    None => LastError::default(),
                };
                Err(native_error(rc, last, related))
            }
        }
    }

    /// Resolves `name` to a wrapper, reusing the live one if the handle is
    /// already bound.
    pub fn lookup(&self, name: &str) -> Result<Option<Object>> {
        let native = self.live_native()?;
        let handle = match self.lookup_handle(name)? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let existing = self.inner.wrappers.lock().object(handle);
        match existing {
            Some(object) => {
                self.release_extra_reference(native, &object);
                Ok(Some(object))
            }
            None => Object::bind(self, handle).map(Some),
        }
    }

    pub(crate) fn lookup_handle(&self, name: &str) -> Result<Option<HandleId>> {
        let native = self.live_native()?;
        let result = self.inner.engine.handle_lookup(native, name);
        self.check(result, None)
    }

    /// Wrapper for an existing handle.
    pub fn wrap(&self, handle: HandleId) -> Result<Object> {
        let existing = self.inner.wrappers.lock().object(handle);
        match existing {
            Some(object) => Ok(object),
            None => Object::bind(self, handle),
        }
    }

    /// Opens an object and runs `init` on it while it is floating. On
    /// success construction is completed; on failure the object is closed.
    pub fn open_object<F>(&self, options: &ObjectOptions, init: F) -> Result<Object>
    where
        F: FnOnce(&Object) -> Result<()>,
    {
        let object = Object::open(self, options)?;
        match init(&object) {
            Ok(()) => {
                object.complete();
                Ok(object)
            }
            Err(e) => {
                if let Err(close_error) = object.close() {
                    warn!("Failed to close {} after failed init: {}", object.describe(), close_error);
                }
                Err(e)
            }
        }
    }

    /// Opens an object for the duration of `f` and always closes it.
    pub fn with_object<F, R>(&self, options: &ObjectOptions, f: F) -> Result<R>
    where
        F: FnOnce(&Object) -> Result<R>,
    {
        let object = Object::open(self, options)?;
        object.complete();
        let result = f(&object);
        let closed = object.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Database currently associated with this context.
    pub fn database(&self) -> Result<Option<Database>> {
        let handle = *self.inner.database.lock();
        match handle {
            Some(handle) => Database::try_from(self.wrap(handle)?).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn attach_database(&self, database: &Object) -> Result<()> {
        let (_, _, handle) = database.live()?;
        *self.inner.database.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn detach_database(&self, handle: HandleId) {
        let mut database = self.inner.database.lock();
        if *database == Some(handle) {
            *database = None;
        }
    }

    pub(crate) fn finalizer(&self) -> Finalizer {
        Arc::clone(&self.inner.finalizer)
    }

    pub(crate) fn wrappers(&self) -> &Mutex<WrapperTable> {
        &self.inner.wrappers
    }

    /// Live wrappers bound in this context.
    pub fn bound_count(&self) -> usize {
        self.inner.wrappers.lock().len()
    }

    /// Native close of a handle whose binding was just released. Skipped
    /// when the native context is already gone.
    pub(crate) fn close_handle(&self, handle: HandleId, related: Option<&Object>) -> Result<()> {
        let native = match self.teardown_native() {
            Some(native) => native,
            None => return Ok(()),
        };
        self.inner.stats.record_native_close();
        let result = self.inner.engine.handle_close(native, handle);
        self.check(result, related)
    }

    /// The engine bumps a handle's reference count when it hands back an
    /// already-open object; the wrapper only ever holds one.
    pub(crate) fn release_extra_reference(&self, native: NativeContextId, object: &Object) {
        if !object.need_close() {
            return;
        }
        if let Some(handle) = object.handle() {
            self.inner.engine.handle_unlink(native, handle);
        }
    }

    pub(crate) fn reserve_floating(&self) -> Result<()> {
        let max = self.inner.options.max_floating;
        if max > 0 && self.floating_count() >= max {
            return Err(Error::InvalidArgument(format!(
                "too many objects under construction (max {})",
                max
            )));
        }
        Ok(())
    }

    pub(crate) fn register_floating(&self, object: &Object) {
        let registered = self
            .inner
            .floating
            .lock()
            .get_or_insert_with(FloatingRegistry::new)
            .register(object);
        if registered {
            object.set_floating(true);
        }
    }

    pub(crate) fn unregister_floating(&self, object: &Object) -> bool {
        let removed = self.unregister_floating_serial(object.serial());
        if removed {
            object.set_floating(false);
        }
        removed
    }

    pub(crate) fn unregister_floating_serial(&self, serial: u64) -> bool {
        self.inner
            .floating
            .lock()
            .as_mut()
            .map_or(false, |registry| registry.unregister(serial))
    }

    pub fn floating_count(&self) -> usize {
        self.inner.floating.lock().as_ref().map_or(0, FloatingRegistry::len)
    }

    pub fn is_floating(&self, object: &Object) -> bool {
        self.inner
            .floating
            .lock()
            .as_ref()
            .map_or(false, |registry| registry.contains(object.serial()))
    }

    /// Force-closes every object still under construction.
    fn sweep_floating(&self) -> usize {
        let registry = self.inner.floating.lock().take();
        let registry = match registry {
            Some(registry) if !registry.is_empty() => registry,
            _ => return 0,
        };

        let mut swept = 0;
        for object in registry.into_objects() {
            object.set_floating(false);
            if let Err(e) = object.close() {
                warn!("Failed to close floating {}: {}", object.describe(), e);
            }
            self.inner.stats.record_swept();
            swept += 1;
        }
        swept
    }
}

fn native_error(rc: ReturnCode, last: LastError, related: Option<&Object>) -> Error {
    let (rc, message) = if last.rc.is_success() {
        (rc, format!("{:?}", rc))
    } else {
        (last.rc, last.message)
    };
    let location = last.file.map(|file| Location {
        file,
        line: last.line,
        function: last.function.unwrap_or_default(),
    });
    Error::NativeEngine {
        rc,
        message,
        location,
        related: related.map(Object::describe),
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.serial)
            .field("native", &self.native_id())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if *self.closed.get_mut() {
            return;
        }
        if let Some(native) = self.native.get_mut().take() {
            if !self.shutdown.is_exited() {
                self.engine.context_fin(native);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::TableKind;
    use crate::native::MemoryEngine;

    fn setup() -> (Arc<MemoryEngine>, Context) {
        let engine = Arc::new(MemoryEngine::new());
        let context = Context::new(engine.clone(), ShutdownCoordinator::new(), ContextOptions::default()).unwrap();
        (engine, context)
    }

    fn hash_options() -> ObjectOptions {
        ObjectOptions::table(TableKind::Hash).key_type("ShortText")
    }

    #[test]
    fn test_close_is_idempotent() {
        let (engine, context) = setup();
        let native = context.native_id().unwrap();
        context.close();
        assert!(context.is_closed());
        let calls = engine.stats().get_calls();

        context.close();
        assert_eq!(engine.stats().get_calls(), calls);
        assert_eq!(engine.open_handles(native), 0);
    }

    #[test]
    fn test_check_error_reports_provenance() {
        let (_engine, context) = setup();
        let err = context
            .open_object(&ObjectOptions::table(TableKind::Hash).key_type("Users"), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let table = context.open_object(&hash_options(), |_| Ok(())).unwrap();
        let result = table.context().unwrap().engine().table_add(
            context.native_id().unwrap(),
            table.handle().unwrap(),
            b"",
        );
        assert!(result.is_err());
        match context.check_error(Some(&table)) {
            Err(Error::NativeEngine {
                rc,
                location,
                related,
                ..
            }) => {
                assert_eq!(rc, ReturnCode::InvalidArgument);
                assert_eq!(location.unwrap().function, "table_add");
                assert!(related.unwrap().contains("Hash"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_failed_init_closes_object() {
        let (engine, context) = setup();
        let native = context.native_id().unwrap();
        let before = engine.open_handles(native);

        let err = context
            .open_object(&hash_options(), |_| Err(Error::InvalidArgument("boom".to_string())))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(engine.open_handles(native), before);
        assert_eq!(context.floating_count(), 0);
    }

    #[test]
    fn test_with_object_always_closes() {
        let (engine, context) = setup();
        let mut seen = None;
        let size = context
            .with_object(&hash_options(), |object| {
                seen = Some(object.clone());
                Ok(object.handle().unwrap())
            })
            .unwrap();
        assert!(!engine.is_open(size));
        assert!(seen.unwrap().is_closed());
    }

    #[test]
    fn test_max_floating() {
        let engine = Arc::new(MemoryEngine::new());
        let options = ContextOptions {
            max_floating: 1,
            ..ContextOptions::default()
        };
        let context = Context::new(engine, ShutdownCoordinator::new(), options).unwrap();

        let first = Object::open(&context, &hash_options()).unwrap();
        assert!(matches!(
            Object::open(&context, &hash_options()),
            Err(Error::InvalidArgument(_))
        ));
        first.complete();
        assert!(Object::open(&context, &hash_options()).is_ok());
    }

    #[test]
    fn test_dropping_last_reference_finalizes_native_context() {
        let (engine, context) = setup();
        let native = context.native_id().unwrap();
        let table = context.open_object(&hash_options(), |_| Ok(())).unwrap();
        let handle = table.handle().unwrap();
        drop(context);
        assert!(engine.is_open(handle));

        drop(table);
        assert!(!engine.is_open(handle));
        assert_eq!(engine.open_handles(native), 0);
        assert_eq!(engine.stats().get_leaked(), 0);
    }

    #[test]
    fn test_check_error_on_closed_context() {
        let (_engine, context) = setup();
        assert!(context.check_error(None).is_ok());
        context.close();
        assert!(context.check_error(None).unwrap_err().is_closed_resource());
    }

    #[test]
    fn test_dropping_floating_object_then_context() {
        let (engine, context) = setup();
        let native = context.native_id().unwrap();
        let object = Object::open(&context, &hash_options()).unwrap();
        let handle = object.handle().unwrap();

        drop(object);
        assert!(!engine.is_open(handle));
        assert_eq!(context.floating_count(), 0);

        drop(context);
        assert_eq!(engine.open_handles(native), 0);
        assert_eq!(engine.stats().get_leaked(), 0);
        assert_eq!(engine.handle_lookup(native, "ShortText"), Err(ReturnCode::ObjectClosed));
    }

    #[test]
    fn test_dropping_context_then_floating_object() {
        let (engine, context) = setup();
        let native = context.native_id().unwrap();
        let object = Object::open(&context, &hash_options()).unwrap();
        let handle = object.handle().unwrap();

        drop(context);
        assert!(engine.is_open(handle));
        assert!(object.is_floating());

        drop(object);
        assert!(!engine.is_open(handle));
        assert_eq!(engine.open_handles(native), 0);
        assert_eq!(engine.stats().get_leaked(), 0);
        assert_eq!(engine.handle_lookup(native, "ShortText"), Err(ReturnCode::ObjectClosed));
    }
}
