use std::sync::Arc;

use mantisdb_binding::{
    Context, ContextOptions, Database, Error, MemoryEngine, Object, ObjectKind, ObjectOptions,
    ShutdownCoordinator, Table, TableKind, Value,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn setup() -> (Arc<MemoryEngine>, Context) {
    let engine = Arc::new(MemoryEngine::new());
    let context = Context::new(engine.clone(), ShutdownCoordinator::new(), ContextOptions::default()).unwrap();
    (engine, context)
}

fn hash_options() -> ObjectOptions {
    ObjectOptions::table(TableKind::Hash).key_type("ShortText")
}

#[test]
fn test_close_then_is_closed() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();
    assert!(!table.is_closed());

    table.close().unwrap();
    assert!(table.is_closed());
    let closes = engine.stats().get_closes();
    let calls = engine.stats().get_calls();

    table.close().unwrap();
    assert!(table.is_closed());
    assert_eq!(engine.stats().get_closes(), closes);
    assert_eq!(engine.stats().get_calls(), calls);
}

#[test]
fn test_context_close_sweeps_floating_objects() {
    let (engine, context) = setup();
    let native = context.native_id().unwrap();

    let objects: Vec<Object> = (0..5)
        .map(|_| Object::open(&context, &hash_options()).unwrap())
        .collect();
    assert_eq!(context.floating_count(), 5);
    assert!(objects.iter().all(Object::is_floating));

    context.close();

    assert!(objects.iter().all(Object::is_closed));
    assert!(objects.iter().all(|object| !object.is_floating()));
    assert_eq!(context.floating_count(), 0);
    assert_eq!(context.stats().get_swept(), 5);
    assert_eq!(engine.stats().get_closes(), 5);
    assert_eq!(engine.stats().get_leaked(), 0);
    assert_eq!(engine.open_handles(native), 0);
}

#[test]
fn test_abandoned_floating_object_is_released_on_drop() {
    let (engine, context) = setup();
    let handle = {
        let object = Object::open(&context, &hash_options()).unwrap();
        assert_eq!(context.floating_count(), 1);
        object.handle().unwrap()
    };
    assert!(!engine.is_open(handle));
    assert_eq!(context.floating_count(), 0);
    assert_eq!(context.stats().get_teardowns(), 1);

    context.close();
    assert_eq!(context.stats().get_swept(), 0);
    assert_eq!(engine.stats().get_leaked(), 0);
}

#[test]
fn test_dropped_context_with_floating_object_is_finalized() {
    let (engine, context) = setup();
    let native = context.native_id().unwrap();
    let object = Object::open(&context, &hash_options()).unwrap();
    let handle = object.handle().unwrap();

    drop(object);
    drop(context);
    assert!(!engine.is_open(handle));
    assert_eq!(engine.open_handles(native), 0);
    assert_eq!(engine.stats().get_leaked(), 0);
}

#[test]
fn test_completed_and_closed_object_is_not_swept() {
    let (engine, context) = setup();
    let object = Object::open(&context, &hash_options()).unwrap();
    object.complete();
    assert!(!object.is_floating());
    object.close().unwrap();
    assert_eq!(engine.stats().get_closes(), 1);

    context.close();
    assert_eq!(engine.stats().get_closes(), 1);
    assert_eq!(context.stats().get_swept(), 0);
    assert_eq!(context.stats().get_teardowns(), 1);
}

#[test]
fn test_interrupted_construction() {
    let (engine, context) = setup();
    let native = context.native_id().unwrap();

    // The table itself opens, then configuring it fails.
    let mut opened = None;
    let err = context
        .open_object(&hash_options().name("Entries"), |object| {
            opened = Some(object.clone());
            let table = Table::try_from(object.clone())?;
            table.create_column("weight", "Decimal")?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let opened = opened.unwrap();
    assert!(opened.is_closed());
    assert_eq!(engine.open_handles(native), 0);
    assert!(context.lookup("Entries").unwrap().is_none());

    context.close();
    assert!(context.is_closed());
    assert_eq!(engine.stats().get_leaked(), 0);
}

#[test]
fn test_two_contexts_are_independent() {
    let engine = Arc::new(MemoryEngine::new());
    let shutdown = ShutdownCoordinator::new();
    let first = Context::new(engine.clone(), shutdown.clone(), ContextOptions::default()).unwrap();
    let second = Context::new(engine.clone(), shutdown, ContextOptions::default()).unwrap();

    let left = Table::create(&first, &hash_options()).unwrap();
    let right = Table::create(&second, &hash_options()).unwrap();
    left.add("a").unwrap();
    right.add("b").unwrap();

    first.close();
    assert!(left.is_closed());
    assert!(!right.is_closed());
    assert_eq!(right.size().unwrap(), 1);
    assert!(right.add("c").unwrap().1);

    // Wrappers from one context cannot be used as options in another.
    let options = ObjectOptions::new(ObjectKind::Cursor).source(right.as_object());
    assert!(matches!(
        Object::open(&first, &options),
        Err(Error::ClosedResource(_))
    ));
    let third = Context::new(engine, ShutdownCoordinator::new(), ContextOptions::default()).unwrap();
    assert!(matches!(
        Object::open(&third, &options),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_closed_context_rejects_new_objects() {
    let (_engine, context) = setup();
    context.close();
    assert!(matches!(
        Table::create(&context, &hash_options()),
        Err(Error::ClosedResource(_))
    ));
    assert!(context.lookup("ShortText").unwrap_err().is_closed_resource());
}

#[test]
fn test_temporary_unlink_releases_handle() {
    let (engine, context) = setup();
    let table = Table::create(&context, &hash_options()).unwrap();
    let handle = table.handle().unwrap();

    table.unlink().unwrap();
    assert!(table.is_closed());
    assert!(!engine.is_open(handle));
    assert_eq!(context.stats().get_teardowns(), 1);
    assert_eq!(context.bound_count(), 0);
}

#[test]
fn test_unlink_of_temporary_table_used_by_name() {
    let (engine, context) = setup();
    let native = context.native_id().unwrap();
    let table = Table::create(&context, &hash_options().name("Tmp")).unwrap();
    table.add("a").unwrap();
    let handle = table.handle().unwrap();

    let cursor = context
        .open_object(&ObjectOptions::new(ObjectKind::Cursor).source("Tmp"), |_| Ok(()))
        .unwrap();
    assert_eq!(engine.refcount(handle), Some(1));
    let again = context.lookup("Tmp").unwrap().unwrap();
    assert!(again.ptr_eq(table.as_object()));
    assert_eq!(engine.refcount(handle), Some(1));

    table.unlink().unwrap();
    assert!(table.is_closed());
    assert!(again.is_closed());
    assert!(!engine.is_open(handle));
    assert!(context.lookup("Tmp").unwrap().is_none());

    cursor.close().unwrap();
    assert_eq!(engine.open_handles(native), 0);
}

#[test]
fn test_closed_database_use() {
    let engine = Arc::new(MemoryEngine::new());
    let per_db = ContextOptions {
        per_db: true,
        ..ContextOptions::default()
    };
    let context = Context::new(engine.clone(), ShutdownCoordinator::new(), per_db).unwrap();
    let database = Database::create(&context, None).unwrap();
    database.close().unwrap();

    assert!(database.is_closed());
    assert!(database.domain().unwrap_err().is_closed_resource());
    assert!(context.database().unwrap_err().is_closed_resource());

    let (_engine, shared) = setup();
    let database = Database::create(&shared, None).unwrap();
    database.close().unwrap();
    assert!(shared.database().unwrap().is_none());
}

#[test]
fn test_persistent_table_survives_context() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("lifecycle.db");
    let engine = Arc::new(MemoryEngine::new());
    let shutdown = ShutdownCoordinator::new();

    let writer = Context::new(engine.clone(), shutdown.clone(), ContextOptions::default()).unwrap();
    let _database = Database::create(&writer, Some(path.as_path())).unwrap();
    let users = Table::create(&writer, &hash_options().name("Users").persistent()).unwrap();
    let age = users.create_column("age", "Int32").unwrap();
    let (alice, _) = users.add("alice").unwrap();
    age.set(alice, &Value::Int(31)).unwrap();

    // Persistent unlink only drops a reference.
    users.unlink().unwrap();
    assert!(!users.is_closed());
    writer.close();
    assert!(users.is_closed());

    let reader = Context::new(engine, shutdown, ContextOptions::default()).unwrap();
    let _database = Database::open(&reader, &path).unwrap();
    let users = Table::try_from(reader.lookup("Users").unwrap().unwrap()).unwrap();
    assert_eq!(users.get("alice").unwrap(), Some(alice));
    let age = users.column("age").unwrap().unwrap();
    assert_eq!(age.range().unwrap().unwrap().name().as_deref(), Some("Int32"));
}

#[test]
fn test_persistent_objects_need_a_database() {
    let (_engine, context) = setup();
    let err = Table::create(&context, &hash_options().name("Users").persistent()).unwrap_err();
    assert_eq!(err.code(), Some(-2));
    assert_eq!(context.floating_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_sweep_closes_exactly_the_floating_objects(steps in prop::collection::vec(0u8..3, 1..24)) {
        let (engine, context) = setup();
        let mut floating: Vec<Object> = Vec::new();
        let mut completed: Vec<Object> = Vec::new();

        for step in steps {
            match step {
                0 => floating.push(Object::open(&context, &hash_options()).unwrap()),
                1 => {
                    if let Some(object) = floating.pop() {
                        object.complete();
                        completed.push(object);
                    }
                }
                _ => {
                    if let Some(object) = completed.pop() {
                        object.close().unwrap();
                    }
                }
            }
        }
        prop_assert_eq!(context.floating_count(), floating.len());

        let closes_before = engine.stats().get_closes();
        context.close();

        prop_assert!(floating.iter().all(Object::is_closed));
        prop_assert_eq!(context.stats().get_swept(), floating.len() as u64);
        prop_assert_eq!(engine.stats().get_closes() - closes_before, floating.len() as u64);
        prop_assert_eq!(engine.stats().get_leaked(), completed.len() as u64);
        prop_assert!(completed.iter().all(Object::is_closed));
    }
}
