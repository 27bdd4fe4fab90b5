use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;

use mantisdb_binding::ffi::*;

fn last_error() -> Option<String> {
    let message = mantis_last_error_message();
    if message.is_null() {
        return None;
    }
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned();
    mantis_string_free(message);
    Some(text)
}

fn bytes(s: &str) -> (*const c_char, usize) {
    (s.as_ptr() as *const c_char, s.len())
}

#[test]
fn test_table_calls_on_unknown_handles() {
    let (key, key_len) = bytes("alice");

    assert_eq!(mantis_table_add(987_654, key, key_len), -1);
    assert_eq!(last_error().as_deref(), Some("unknown object handle: 987654"));

    assert_eq!(mantis_table_size(987_654), -1);
    assert_eq!(last_error().as_deref(), Some("unknown object handle: 987654"));

    assert_eq!(mantis_table_add(987_654, ptr::null(), 0), -1);
    assert_eq!(last_error().as_deref(), Some("key is null"));
}

#[test]
fn test_table_calls_on_wrong_kind() {
    assert_eq!(mantis_binding_init(ptr::null(), 0), 0);
    let context = mantis_context_new();
    assert_ne!(context, 0);

    let (type_name, type_name_len) = bytes("ShortText");
    let short_text = mantis_context_lookup(context, type_name, type_name_len);
    assert_ne!(short_text, 0);

    let (key, key_len) = bytes("alice");
    assert_eq!(mantis_table_add(short_text, key, key_len), -1);
    assert!(last_error().unwrap().starts_with("Type mismatch"));
    assert_eq!(mantis_table_size(short_text), -1);
    assert!(last_error().unwrap().starts_with("Type mismatch"));

    // Shared objects are never closed by the binding
    assert_eq!(mantis_object_is_closed(short_text), 0);

    let (missing, missing_len) = bytes("Missing");
    assert_eq!(mantis_context_lookup(context, missing, missing_len), 0);
    assert_eq!(last_error().as_deref(), Some("no such object: <Missing>"));

    mantis_object_free(short_text);
    assert_eq!(mantis_context_close(context), 0);
    mantis_context_free(context);
}
