use std::sync::Arc;

use mantisdb_binding::{
    Binding, BindingConfig, Context, ContextOptions, MemoryEngine, NativeEngine, Object, ObjectKind,
    ObjectOptions, ShutdownCoordinator, Table, TableKind,
};

fn setup() -> (Arc<MemoryEngine>, Context) {
    let engine = Arc::new(MemoryEngine::new());
    let context = Context::new(engine.clone(), ShutdownCoordinator::new(), ContextOptions::default()).unwrap();
    (engine, context)
}

fn hash_options() -> ObjectOptions {
    ObjectOptions::table(TableKind::Hash).key_type("ShortText")
}

#[test]
fn test_managed_close_then_native_teardown() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();
    assert!(table.have_finalizer());

    table.close().unwrap();
    context.close();

    assert_eq!(context.stats().get_teardowns(), 1);
    assert_eq!(context.stats().get_native_finalized(), 0);
    // The engine still ran the handle's finalizer, which found nothing bound.
    assert_eq!(engine.stats().get_finalizers_fired(), 1);
}

#[test]
fn test_native_teardown_then_managed_close() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();

    context.close();
    assert!(table.is_closed());
    assert_eq!(context.stats().get_native_finalized(), 1);
    let calls = engine.stats().get_calls();

    table.close().unwrap();
    drop(table);

    assert_eq!(context.stats().get_teardowns(), 1);
    assert_eq!(engine.stats().get_calls(), calls);
}

#[test]
fn test_engine_releases_handle_behind_the_wrapper() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();
    let handle = table.handle().unwrap();

    engine.handle_close(context.native_id().unwrap(), handle).unwrap();

    assert!(table.is_closed());
    assert!(table.size().unwrap_err().is_closed_resource());
    assert_eq!(context.stats().get_teardowns(), 1);
    assert_eq!(context.bound_count(), 0);

    let closes = engine.stats().get_closes();
    table.close().unwrap();
    drop(table);
    assert_eq!(engine.stats().get_closes(), closes);
    assert_eq!(context.stats().get_teardowns(), 1);
}

#[test]
fn test_drop_then_context_close() {
    let (engine, context) = setup();
    let native = context.native_id().unwrap();
    let table = Table::create(&context, &hash_options()).unwrap();
    let handle = table.handle().unwrap();

    drop(table);
    assert!(!engine.is_open(handle));
    context.close();

    assert_eq!(context.stats().get_teardowns(), 1);
    assert_eq!(engine.stats().get_leaked(), 0);
    assert_eq!(engine.open_handles(native), 0);
}

#[test]
fn test_shared_objects_never_closed() {
    let (engine, context) = setup();
    let short_text = context.lookup("ShortText").unwrap().unwrap();
    let bigram = context.lookup("TokenBigram").unwrap().unwrap();
    assert_eq!(short_text.kind(), ObjectKind::Type);
    assert_eq!(bigram.kind(), ObjectKind::Procedure);
    assert!(!short_text.need_close());
    assert!(!bigram.need_close());

    short_text.close().unwrap();
    drop(short_text);
    drop(bigram);
    context.close();

    assert_eq!(engine.stats().get_shared_close_attempts(), 0);
    assert_eq!(engine.stats().get_closes(), 0);
    assert_eq!(context.stats().get_native_closes(), 0);
}

#[test]
fn test_accessor_teardown_without_native_finalizer() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();
    let accessor = table.key_accessor().unwrap();
    let handle = accessor.handle().unwrap();
    assert!(!engine.has_finalizer(handle));
    assert!(accessor.have_finalizer());

    drop(accessor);
    assert!(!engine.is_open(handle));
    assert_eq!(context.stats().get_teardowns(), 1);
}

#[test]
fn test_cursor_released_by_context_is_reported_closed() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();
    let cursor = table.open_cursor().unwrap();
    assert!(!cursor.have_finalizer());

    context.close();
    // No finalizer slot, so the wrapper learns about it from its context.
    assert!(cursor.is_closed());
    let calls = engine.stats().get_calls();
    drop(cursor);
    assert_eq!(engine.stats().get_calls(), calls);
}

#[test]
fn test_exit_makes_no_native_calls_afterwards() {
    let engine = Arc::new(MemoryEngine::new());
    let binding = Binding::init(engine.clone(), BindingConfig::default()).unwrap();

    let default_context = binding.default_context().unwrap();
    let other = binding.new_context(None).unwrap();
    let table = Table::create(&default_context, &hash_options()).unwrap();
    let column = table.create_column("title", "Text").unwrap();
    let cursor = table.open_cursor().unwrap();
    let floating = Object::open(&other, &hash_options()).unwrap();

    binding.exit();
    assert!(binding.is_exited());
    let calls = engine.stats().get_calls();

    for object in [table.as_object(), column.as_object(), cursor.as_object(), &floating] {
        assert!(object.is_closed());
        object.close().unwrap();
    }
    drop(table);
    drop(column);
    drop(cursor);
    drop(floating);
    default_context.close();
    other.close();
    binding.exit();

    assert_eq!(engine.stats().get_calls(), calls);
    assert!(default_context.is_closed());
    assert!(other.is_closed());
    assert_eq!(other.floating_count(), 0);
}
