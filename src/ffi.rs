//! FFI bindings for the host runtime.
//!
//! The host never sees Rust pointers. Contexts and objects are handed out as
//! opaque integer handles; the handle->wrapper mapping lives entirely in Rust
//! memory. `*_free` is what the host's garbage collector calls when its own
//! reference goes away: it drops our reference, and if that was the last one
//! the wrapper's drop path releases the native handle.
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::binding::Binding;
use crate::config::BindingConfig;
use crate::context::Context;
use crate::error::Error;
use crate::kind::TableKind;
use crate::native::MemoryEngine;
use crate::object::Object;
use crate::objects::Table;
use crate::options::ObjectOptions;

lazy_static::lazy_static! {
    static ref BINDING: Mutex<Option<Binding>> = Mutex::new(None);
    static ref CONTEXT_HANDLES: Mutex<HashMap<usize, Context>> = Mutex::new(HashMap::new());
    static ref OBJECT_HANDLES: Mutex<HashMap<usize, Object>> = Mutex::new(HashMap::new());
    static ref NEXT_HANDLE: Mutex<usize> = Mutex::new(1);
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = RefCell::new(None);
}

// Monotonically increasing handle IDs - never reused even after free, so a
// stale host handle can never reach a different object.
fn next_handle() -> usize {
    let mut handle = NEXT_HANDLE.lock();
    let id = *handle;
    *handle += 1;
    id
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// Records `err` for `mantis_last_error_message` and maps it to a negative
/// return code (the engine's own code when there is one).
fn fail(err: Error) -> c_int {
    let code = err.code().filter(|code| *code < 0).unwrap_or(-1);
    set_last_error(err.to_string());
    code
}

fn binding() -> Option<Binding> {
    let binding = BINDING.lock().clone();
    if binding.is_none() {
        set_last_error("binding is not initialized".to_string());
    }
    binding
}

fn context(handle: usize) -> Option<Context> {
    let context = CONTEXT_HANDLES.lock().get(&handle).cloned();
    if context.is_none() {
        set_last_error(format!("unknown context handle: {}", handle));
    }
    context
}

fn object(handle: usize) -> Option<Object> {
    let object = OBJECT_HANDLES.lock().get(&handle).cloned();
    if object.is_none() {
        set_last_error(format!("unknown object handle: {}", handle));
    }
    object
}

/// Borrows a UTF-8 string argument. Null means absent.
fn str_arg<'a>(ptr: *const c_char, len: usize) -> Result<Option<&'a str>, ()> {
    if ptr.is_null() {
        return Ok(None);
    }
    // The host guarantees ptr/len describe a live buffer for the duration
    // of the call.
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(Some(s)),
        Err(_) => {
            set_last_error("argument is not valid UTF-8".to_string());
            Err(())
        }
    }
}

// ============================================================================
// Binding FFI
// ============================================================================

/// Initialize the binding. `config_json` may be null to configure from the
/// environment. Initializing twice is a no-op.
#[no_mangle]
pub extern "C" fn mantis_binding_init(config_json: *const c_char, config_len: usize) -> c_int {
    let mut slot = BINDING.lock();
    if slot.is_some() {
        return 0;
    }

    let config = match str_arg(config_json, config_len) {
        Ok(Some(json)) => BindingConfig::from_json(json),
        Ok(None) => BindingConfig::from_env(),
        Err(()) => return -1,
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => return fail(e),
    };
    if let Err(e) = crate::logging::init(&config.logging) {
        return fail(e);
    }

    let binding = match Binding::init(Arc::new(MemoryEngine::new()), config) {
        Ok(binding) => binding,
        Err(e) => return fail(e),
    };
    if let Err(e) = binding.install_exit_hook() {
        return fail(e);
    }
    *slot = Some(binding);
    0
}

/// Tear the binding down. Handles stay valid but every wrapper reports
/// closed; freeing them afterwards makes no engine calls.
#[no_mangle]
pub extern "C" fn mantis_binding_exit() -> c_int {
    match binding() {
        Some(binding) => {
            binding.exit();
            0
        }
        None => -1,
    }
}

// ============================================================================
// Context FFI
// ============================================================================

/// Create a new context. Returns 0 on failure.
#[no_mangle]
pub extern "C" fn mantis_context_new() -> usize {
    let binding = match binding() {
        Some(binding) => binding,
        None => return 0,
    };
    match binding.new_context(None) {
        Ok(context) => {
            let handle = next_handle();
            CONTEXT_HANDLES.lock().insert(handle, context);
            handle
        }
        Err(e) => {
            fail(e);
            0
        }
    }
}

/// Handle to the default context. Each call returns a fresh handle.
#[no_mangle]
pub extern "C" fn mantis_context_default() -> usize {
    let binding = match binding() {
        Some(binding) => binding,
        None => return 0,
    };
    match binding.default_context() {
        Ok(context) => {
            let handle = next_handle();
            CONTEXT_HANDLES.lock().insert(handle, context);
            handle
        }
        Err(e) => {
            fail(e);
            0
        }
    }
}

/// Look up a named object (a table, a column or a builtin type). Returns 0
/// when there is no such object or on failure.
#[no_mangle]
pub extern "C" fn mantis_context_lookup(context_handle: usize, name: *const c_char, name_len: usize) -> usize {
    let context = match context(context_handle) {
        Some(context) => context,
        None => return 0,
    };
    let name = match str_arg(name, name_len) {
        Ok(Some(name)) => name,
        Ok(None) => {
            set_last_error("name is required".to_string());
            return 0;
        }
        Err(()) => return 0,
    };
    match context.lookup(name) {
        Ok(Some(object)) => {
            let handle = next_handle();
            OBJECT_HANDLES.lock().insert(handle, object);
            handle
        }
        Ok(None) => {
            set_last_error(format!("no such object: <{}>", name));
            0
        }
        Err(e) => {
            fail(e);
            0
        }
    }
}

/// Close a context. Objects still under construction are closed with it.
#[no_mangle]
pub extern "C" fn mantis_context_close(handle: usize) -> c_int {
    match context(handle) {
        Some(context) => {
            context.close();
            0
        }
        None => -1,
    }
}

/// Drop the host's reference to a context
#[no_mangle]
pub extern "C" fn mantis_context_free(handle: usize) {
    let context = CONTEXT_HANDLES.lock().remove(&handle);
    drop(context);
}

// ============================================================================
// Table FFI
// ============================================================================

/// Create a hash table keyed by `key_type`. `name` may be null for an
/// anonymous table. Returns 0 on failure.
#[no_mangle]
pub extern "C" fn mantis_table_create(
    context_handle: usize,
    name: *const c_char,
    name_len: usize,
    key_type: *const c_char,
    key_type_len: usize,
) -> usize {
    let context = match context(context_handle) {
        Some(context) => context,
        None => return 0,
    };
    let (name, key_type) = match (str_arg(name, name_len), str_arg(key_type, key_type_len)) {
        (Ok(name), Ok(Some(key_type))) => (name, key_type),
        (Ok(_), Ok(None)) => {
            set_last_error("key type is required".to_string());
            return 0;
        }
        _ => return 0,
    };

    let mut options = ObjectOptions::table(TableKind::Hash).key_type(key_type);
    if let Some(name) = name {
        options = options.name(name);
    }
    match Table::create(&context, &options) {
        Ok(table) => {
            let handle = next_handle();
            OBJECT_HANDLES.lock().insert(handle, table.into_object());
            handle
        }
        Err(e) => {
            fail(e);
            0
        }
    }
}

/// Add a key. Returns the record id, or a negative error code.
#[no_mangle]
pub extern "C" fn mantis_table_add(handle: usize, key: *const c_char, key_len: usize) -> i64 {
    if key.is_null() {
        set_last_error("key is null".to_string());
        return -1;
    }
    let table = match object(handle).map(Table::try_from) {
        Some(Ok(table)) => table,
        Some(Err(e)) => return fail(e) as i64,
        None => return -1,
    };
    let key = match str_arg(key, key_len) {
        Ok(Some(key)) => key,
        _ => return -1,
    };

    match table.add(key) {
        Ok((record, _)) => record.0 as i64,
        Err(e) => fail(e) as i64,
    }
}

/// Number of records, or a negative error code.
#[no_mangle]
pub extern "C" fn mantis_table_size(handle: usize) -> i64 {
    let table = match object(handle).map(Table::try_from) {
        Some(Ok(table)) => table,
        Some(Err(e)) => return fail(e) as i64,
        None => return -1,
    };
    match table.size() {
        Ok(size) => size as i64,
        Err(e) => fail(e) as i64,
    }
}

// ============================================================================
// Object FFI
// ============================================================================

#[no_mangle]
pub extern "C" fn mantis_object_close(handle: usize) -> c_int {
    let object = match object(handle) {
        Some(object) => object,
        None => return -1,
    };
    match object.close() {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// 1 when closed, 0 when live, -1 for an unknown handle.
#[no_mangle]
pub extern "C" fn mantis_object_is_closed(handle: usize) -> c_int {
    match object(handle) {
        Some(object) => c_int::from(object.is_closed()),
        None => -1,
    }
}

/// Drop the host's reference to an object
#[no_mangle]
pub extern "C" fn mantis_object_free(handle: usize) {
    // Removed under the lock, dropped after it: the drop may call into the
    // engine.
    let object = OBJECT_HANDLES.lock().remove(&handle);
    drop(object);
}

// ============================================================================
// Errors
// ============================================================================

/// Message of the calling thread's last failure, or null. Free with
/// `mantis_string_free`.
#[no_mangle]
pub extern "C" fn mantis_last_error_message() -> *mut c_char {
    let message = LAST_ERROR.with(|slot| slot.borrow().clone());
    let message = match message {
        Some(message) => message,
        None => return std::ptr::null_mut(),
    };

    // Allocate with libc malloc (not the Rust allocator) because the host
    // frees it with its C runtime.
    let bytes = message.as_bytes();
    unsafe {
        let buf = libc::malloc(bytes.len() + 1) as *mut u8;
        if buf.is_null() {
            return std::ptr::null_mut();
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
        *buf.add(bytes.len()) = 0;
        buf as *mut c_char
    }
}

/// Free a string returned by this library
#[no_mangle]
pub extern "C" fn mantis_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            libc::free(ptr as *mut c_void);
        }
    }
}

/// Get version information
#[no_mangle]
pub extern "C" fn mantis_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}
