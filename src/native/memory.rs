//! In-process reference engine.
//!
//! A deliberately naive implementation of the `NativeEngine` contract: tables are
//! vectors plus a key map, the index is a whitespace term map. It exists so the
//! lifecycle bridge can run without the real engine linked in, and it keeps the
//! bookkeeping the real engine only exposes through its debug build: a call
//! counter, closed/leaked handle counters and per-handle reference counts.

use std::collections::BTreeSet;
use std::panic::Location;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use super::{
    FinalizeEvent, Finalizer, HandleFlags, HandleId, HandleInfo, LastError, NativeContextId,
    NativeEngine, NativeResult, OpenRequest, RecordId, ReturnCode, UserData, Value,
};
use crate::config::{ContextOptions, Encoding};
use crate::kind::{ColumnKind, ObjectKind, TableKind};

const MAX_SHORT_TEXT_KEY: usize = 4096;

const BUILTIN_TYPES: [&str; 7] = [
    "Bool",
    "Int32",
    "Int64",
    "Float",
    "ShortText",
    "Text",
    "LongText",
];

const BUILTIN_PROCEDURES: [&str; 2] = ["TokenBigram", "NormalizerAuto"];

const DATABASE_MAGIC: &[u8] = b"MANTISDB\n";

/// Engine call statistics (lock-free counters)
pub struct EngineStats {
    calls: AtomicU64,
    closes: AtomicU64,
    shared_close_attempts: AtomicU64,
    finalizers_fired: AtomicU64,
    leaked: AtomicU64,
}

impl EngineStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            shared_close_attempts: AtomicU64::new(0),
            finalizers_fired: AtomicU64::new(0),
            leaked: AtomicU64::new(0),
        }
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Every contract call, including failed ones and calls after `fin`.
    pub fn get_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Handles released by `handle_close` or by an unlink reaching zero.
    pub fn get_closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// `handle_close` calls aimed at shared type/procedure handles.
    pub fn get_shared_close_attempts(&self) -> u64 {
        self.shared_close_attempts.load(Ordering::Relaxed)
    }

    pub fn get_finalizers_fired(&self) -> u64 {
        self.finalizers_fired.load(Ordering::Relaxed)
    }

    /// Handles still open when their context (or the engine) was finalized.
    pub fn get_leaked(&self) -> u64 {
        self.leaked.load(Ordering::Relaxed)
    }
}

enum Payload {
    Empty,
    Table(TableData),
    Column(ColumnData),
    Index(IndexData),
    Cursor(CursorData),
}

struct TableData {
    keyed: bool,
    keys: Vec<Option<Vec<u8>>>,
    ids: AHashMap<Vec<u8>, RecordId>,
    live: u64,
}

impl TableData {
    fn new(keyed: bool) -> Self {
        Self {
            keyed,
            keys: Vec::new(),
            ids: AHashMap::new(),
            live: 0,
        }
    }

    fn add(&mut self, key: &[u8]) -> (RecordId, bool) {
        if self.keyed {
            if let Some(id) = self.ids.get(key) {
                return (*id, false);
            }
        }
        self.keys.push(Some(key.to_vec()));
        let id = RecordId(self.keys.len() as u32);
        if self.keyed {
            self.ids.insert(key.to_vec(), id);
        }
        self.live += 1;
        (id, true)
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        match self.ids.remove(key) {
            Some(id) => {
                self.keys[id.0 as usize - 1] = None;
                self.live -= 1;
                true
            }
            None => false,
        }
    }

    fn key(&self, record: RecordId) -> Option<Vec<u8>> {
        let index = (record.0 as usize).checked_sub(1)?;
        self.keys.get(index)?.clone()
    }

    fn records(&self) -> Vec<RecordId> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.is_some())
            .map(|(i, _)| RecordId(i as u32 + 1))
            .collect()
    }
}

#[derive(Default)]
struct ColumnData {
    values: AHashMap<RecordId, Value>,
}

#[derive(Default)]
struct IndexData {
    postings: AHashMap<String, BTreeSet<RecordId>>,
}

struct CursorData {
    records: Vec<RecordId>,
    position: usize,
}

struct HandleSlot {
    /// None for builtin shared handles
    context: Option<NativeContextId>,
    tag: u8,
    name: Option<String>,
    flags: HandleFlags,
    domain: Option<HandleId>,
    range: Option<HandleId>,
    refcount: u32,
    user_data: Option<UserData>,
    finalizer: Option<Finalizer>,
    payload: Arc<Mutex<Payload>>,
}

impl HandleSlot {
    fn new(context: NativeContextId, kind: ObjectKind, payload: Payload) -> Self {
        Self {
            context: Some(context),
            tag: kind.tag(),
            name: None,
            flags: HandleFlags::default(),
            domain: None,
            range: None,
            refcount: 1,
            user_data: None,
            finalizer: None,
            payload: Arc::new(Mutex::new(payload)),
        }
    }
}

/// Owned copy of the parts of a slot an operation needs.
struct SlotView {
    tag: u8,
    builtin: bool,
    domain: Option<HandleId>,
    payload: Arc<Mutex<Payload>>,
}

#[derive(Clone)]
struct CatalogEntry {
    tag: u8,
    flags: HandleFlags,
    domain: Option<String>,
    range: Option<String>,
    payload: Arc<Mutex<Payload>>,
}

struct ContextSlot {
    options: ContextOptions,
    last_error: LastError,
    by_name: AHashMap<String, HandleId>,
    database: Option<HandleId>,
}

struct EngineState {
    finalized: bool,
    next_context: u64,
    contexts: AHashMap<NativeContextId, ContextSlot>,
    handles: Vec<Option<HandleSlot>>,
    builtins: AHashMap<String, HandleId>,
    catalog: AHashMap<String, CatalogEntry>,
}

type Pending = Vec<(FinalizeEvent, Finalizer)>;

impl EngineState {
    fn new() -> Self {
        let mut state = Self {
            finalized: false,
            next_context: 1,
            contexts: AHashMap::new(),
            // Slot 0 stays empty so HandleId(0) is never valid
            handles: vec![None],
            builtins: AHashMap::new(),
            catalog: AHashMap::new(),
        };

        let builtins = BUILTIN_TYPES
            .iter()
            .map(|name| (ObjectKind::Type, *name))
            .chain(BUILTIN_PROCEDURES.iter().map(|name| (ObjectKind::Procedure, *name)));
        for (kind, name) in builtins {
            let slot = HandleSlot {
                context: None,
                tag: kind.tag(),
                name: Some(name.to_string()),
                flags: HandleFlags {
                    persistent: true,
                    with_subrec: false,
                },
                domain: None,
                range: None,
                refcount: 1,
                user_data: None,
                finalizer: None,
                payload: Arc::new(Mutex::new(Payload::Empty)),
            };
            if let Ok(id) = state.allocate(slot) {
                state.builtins.insert(name.to_string(), id);
            }
        }
        state
    }

    fn enter(&mut self, context: NativeContextId) -> NativeResult<()> {
        if self.finalized {
            return Err(ReturnCode::OperationNotPermitted);
        }
        match self.contexts.get_mut(&context) {
            Some(slot) => {
                slot.last_error = LastError::default();
                Ok(())
            }
            None => Err(ReturnCode::ObjectClosed),
        }
    }

    #[track_caller]
    fn fail<T>(
        &mut self,
        context: NativeContextId,
        rc: ReturnCode,
        message: impl Into<String>,
        function: &str,
    ) -> NativeResult<T> {
        let caller = Location::caller();
        if let Some(slot) = self.contexts.get_mut(&context) {
            slot.last_error = LastError {
                rc,
                message: message.into(),
                file: Some(caller.file().to_string()),
                line: caller.line(),
                function: Some(function.to_string()),
            };
        }
        Err(rc)
    }

    fn allocate(&mut self, slot: HandleSlot) -> NativeResult<HandleId> {
        let id = match handle_id_at(self.handles.len()) {
            Some(id) => id,
            None => {
                let message = format!("handle space exhausted at {} handles", self.handles.len());
                return match slot.context {
                    Some(context) => self.fail(context, ReturnCode::NoMemoryAvailable, message, "allocate"),
                    None => Err(ReturnCode::NoMemoryAvailable),
                };
            }
        };
        self.handles.push(Some(slot));
        Ok(id)
    }

    fn slot(&self, context: NativeContextId, handle: HandleId) -> Option<&HandleSlot> {
        self.handles
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .filter(|slot| slot.context.map_or(true, |owner| owner == context))
    }

    /// Handle ids are never reused, so an empty slot is a released handle.
    fn was_released(&self, handle: HandleId) -> bool {
        matches!(self.handles.get(handle.index()), Some(None))
    }

    fn slot_mut(&mut self, context: NativeContextId, handle: HandleId) -> Option<&mut HandleSlot> {
        self.handles
            .get_mut(handle.index())
            .and_then(|slot| slot.as_mut())
            .filter(|slot| slot.context.map_or(true, |owner| owner == context))
    }

    fn name_of(&self, handle: Option<HandleId>) -> Option<&str> {
        self.handles
            .get(handle?.index())?
            .as_ref()?
            .name
            .as_deref()
    }

    fn kind_of(&self, handle: HandleId) -> Option<ObjectKind> {
        let slot = self.handles.get(handle.index())?.as_ref()?;
        ObjectKind::from_tag(slot.tag).ok()
    }

    #[track_caller]
    fn resolve(
        &mut self,
        context: NativeContextId,
        handle: HandleId,
        function: &str,
    ) -> NativeResult<SlotView> {
        let view = self.slot(context, handle).map(|slot| SlotView {
            tag: slot.tag,
            builtin: slot.context.is_none(),
            domain: slot.domain,
            payload: Arc::clone(&slot.payload),
        });
        match view {
            Some(view) => Ok(view),
            None => self.fail(
                context,
                ReturnCode::NotFound,
                format!("no such object: {}", handle),
                function,
            ),
        }
    }

    #[track_caller]
    fn resolve_kind(
        &mut self,
        context: NativeContextId,
        handle: HandleId,
        expected: fn(ObjectKind) -> bool,
        function: &str,
    ) -> NativeResult<SlotView> {
        let view = self.resolve(context, handle, function)?;
        match ObjectKind::from_tag(view.tag) {
            Ok(kind) if expected(kind) => Ok(view),
            _ => self.fail(
                context,
                ReturnCode::InvalidArgument,
                format!("unexpected object type for {}: {:#04x}", handle, view.tag),
                function,
            ),
        }
    }

    /// Removes the slot and its context bookkeeping.
    fn release(&mut self, handle: HandleId) -> Option<HandleSlot> {
        let slot = self.handles.get_mut(handle.index())?.take()?;
        if let Some(context) = slot.context.and_then(|c| self.contexts.get_mut(&c)) {
            if let Some(name) = &slot.name {
                if context.by_name.get(name) == Some(&handle) {
                    context.by_name.remove(name);
                }
            }
            if context.database == Some(handle) {
                context.database = None;
            }
        }
        Some(slot)
    }

    fn event(context: NativeContextId, handle: HandleId, slot: HandleSlot) -> Option<(FinalizeEvent, Finalizer)> {
        let finalizer = slot.finalizer?;
        let event = FinalizeEvent {
            context,
            handle,
            user_data: slot.user_data,
        };
        Some((event, finalizer))
    }

    /// Releases every handle a context owns, newest first so dependents go
    /// before the objects they point at.
    fn reclaim_context(&mut self, context: NativeContextId, stats: &EngineStats) -> Pending {
        let owned: Vec<HandleId> = self
            .handles
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|slot| slot.context == Some(context))
                    .map(|_| HandleId(i as u32))
            })
            .collect();

        let mut pending = Vec::new();
        for handle in owned {
            if let Some(slot) = self.release(handle) {
                stats.leaked.fetch_add(1, Ordering::Relaxed);
                pending.extend(Self::event(context, handle, slot));
            }
        }
        self.contexts.remove(&context);
        pending
    }

    fn lookup(
        &mut self,
        context: NativeContextId,
        name: &str,
        function: &str,
    ) -> NativeResult<Option<HandleId>> {
        if let Some(id) = self.builtins.get(name) {
            return Ok(Some(*id));
        }

        let open = self
            .contexts
            .get(&context)
            .and_then(|slot| slot.by_name.get(name).copied());
        if let Some(id) = open {
            if let Some(slot) = self.slot_mut(context, id) {
                slot.refcount += 1;
            }
            return Ok(Some(id));
        }

        let entry = match self.catalog.get(name) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        self.require_database(context, function)?;

        let domain = match &entry.domain {
            Some(domain) => Some(self.lookup_required(context, domain, function)?),
            None => None,
        };
        let range = match &entry.range {
            Some(range) => Some(self.lookup_required(context, range, function)?),
            None => None,
        };

        let id = self.allocate(HandleSlot {
            context: Some(context),
            tag: entry.tag,
            name: Some(name.to_string()),
            flags: entry.flags,
            domain,
            range,
            refcount: 1,
            user_data: None,
            finalizer: None,
            payload: entry.payload,
        })?;
        if let Some(slot) = self.contexts.get_mut(&context) {
            slot.by_name.insert(name.to_string(), id);
        }
        Ok(Some(id))
    }

    fn lookup_required(
        &mut self,
        context: NativeContextId,
        name: &str,
        function: &str,
    ) -> NativeResult<HandleId> {
        match self.lookup(context, name, function)? {
            Some(id) => Ok(id),
            None => self.fail(
                context,
                ReturnCode::NotFound,
                format!("no such object: <{}>", name),
                function,
            ),
        }
    }

    fn require_database(&mut self, context: NativeContextId, function: &str) -> NativeResult<()> {
        let has_database = self
            .contexts
            .get(&context)
            .map_or(false, |slot| slot.database.is_some());
        if has_database {
            Ok(())
        } else {
            self.fail(
                context,
                ReturnCode::OperationNotPermitted,
                "persistent objects require an opened database",
                function,
            )
        }
    }

    fn open(&mut self, context: NativeContextId, request: &OpenRequest) -> NativeResult<HandleId> {
        const FUNCTION: &str = "handle_open";

        if request.flags.persistent && request.name.is_none() && request.kind != ObjectKind::Database {
            return self.fail(context, ReturnCode::InvalidArgument, "persistent objects need a name", FUNCTION);
        }
        if let (Some(name), false) = (&request.name, request.flags.persistent) {
            let taken = self
                .contexts
                .get(&context)
                .map_or(false, |slot| slot.by_name.contains_key(name));
            if taken || self.builtins.contains_key(name) {
                return self.fail(
                    context,
                    ReturnCode::FileExists,
                    format!("already used name: <{}>", name),
                    FUNCTION,
                );
            }
        }

        if let (Some(name), true) = (&request.name, request.flags.persistent) {
            self.require_database(context, FUNCTION)?;
            let exists = self.builtins.contains_key(name) || self.catalog.contains_key(name);
            if request.create && exists {
                return self.fail(
                    context,
                    ReturnCode::FileExists,
                    format!("already used name: <{}>", name),
                    FUNCTION,
                );
            }
            if !request.create {
                return self.lookup_required(context, name, FUNCTION);
            }
        }

        let payload = match request.kind {
            ObjectKind::Type | ObjectKind::Procedure => {
                return self.fail(
                    context,
                    ReturnCode::OperationNotPermitted,
                    "builtin objects cannot be created",
                    FUNCTION,
                );
            }
            ObjectKind::Database => return self.open_database(context, request),
            ObjectKind::Table(kind) => {
                let keyed = kind != TableKind::Array;
                if keyed && self.kind_of_opt(request.domain) != Some(ObjectKind::Type) {
                    return self.fail(context, ReturnCode::InvalidArgument, "key type must be a type", FUNCTION);
                }
                Payload::Table(TableData::new(keyed))
            }
            ObjectKind::Column(kind) => {
                if !self.kind_of_opt(request.domain).map_or(false, ObjectKind::is_table) {
                    return self.fail(context, ReturnCode::InvalidArgument, "columns belong to a table", FUNCTION);
                }
                match kind {
                    ColumnKind::Index => Payload::Index(IndexData::default()),
                    ColumnKind::Fixed | ColumnKind::Variable => {
                        let range_ok = matches!(
                            self.kind_of_opt(request.range),
                            Some(ObjectKind::Type) | Some(ObjectKind::Table(_))
                        );
                        if !range_ok {
                            return self.fail(context, ReturnCode::InvalidArgument, "value type is required", FUNCTION);
                        }
                        Payload::Column(ColumnData::default())
                    }
                }
            }
            ObjectKind::Cursor => return self.open_cursor(context, request),
            ObjectKind::Accessor => return self.open_accessor(context, request),
            ObjectKind::Expression | ObjectKind::Snippet => Payload::Empty,
        };

        let mut slot = HandleSlot::new(context, request.kind, payload);
        slot.flags = request.flags;
        slot.domain = request.domain;
        slot.range = request.range;

        if let (Some(name), true) = (&request.name, request.flags.persistent) {
            let domain = self.catalog_name(context, request.domain, FUNCTION)?;
            let range = self.catalog_name(context, request.range, FUNCTION)?;
            self.catalog.insert(
                name.clone(),
                CatalogEntry {
                    tag: slot.tag,
                    flags: slot.flags,
                    domain,
                    range,
                    payload: Arc::clone(&slot.payload),
                },
            );
            slot.name = Some(name.clone());
        }

        if let (Some(name), false) = (&request.name, request.flags.persistent) {
            slot.name = Some(name.clone());
        }

        let id = self.allocate(slot)?;
        if let Some(name) = &request.name {
            if let Some(context) = self.contexts.get_mut(&context) {
                context.by_name.insert(name.clone(), id);
            }
        }
        Ok(id)
    }

    fn kind_of_opt(&self, handle: Option<HandleId>) -> Option<ObjectKind> {
        self.kind_of(handle?)
    }

    /// Persistent objects may only point at other named objects.
    fn catalog_name(
        &mut self,
        context: NativeContextId,
        handle: Option<HandleId>,
        function: &str,
    ) -> NativeResult<Option<String>> {
        let handle = match handle {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let name = self
            .name_of(Some(handle))
            .filter(|name| self.builtins.contains_key(*name) || self.catalog.contains_key(*name))
            .map(str::to_string);
        match name {
            Some(name) => Ok(Some(name)),
            None => self.fail(
                context,
                ReturnCode::InvalidArgument,
                format!("persistent object cannot refer to temporary {}", handle),
                function,
            ),
        }
    }

    fn open_database(&mut self, context: NativeContextId, request: &OpenRequest) -> NativeResult<HandleId> {
        const FUNCTION: &str = "db_open";

        let has_database = self
            .contexts
            .get(&context)
            .map_or(false, |slot| slot.database.is_some());
        if has_database {
            return self.fail(context, ReturnCode::OperationNotPermitted, "database already opened", FUNCTION);
        }

        if let Some(path) = &request.path {
            let result = if request.create {
                create_database_file(path)
            } else {
                check_database_file(path)
            };
            if let Err((rc, message)) = result {
                return self.fail(context, rc, message, FUNCTION);
            }
        }

        let mut slot = HandleSlot::new(context, ObjectKind::Database, Payload::Empty);
        slot.flags.persistent = request.path.is_some();
        let id = self.allocate(slot)?;
        if let Some(context) = self.contexts.get_mut(&context) {
            context.database = Some(id);
        }
        Ok(id)
    }

    fn open_cursor(&mut self, context: NativeContextId, request: &OpenRequest) -> NativeResult<HandleId> {
        const FUNCTION: &str = "table_cursor_open";

        let source = match request.source {
            Some(source) => source,
            None => return self.fail(context, ReturnCode::InvalidArgument, "cursor needs a table", FUNCTION),
        };
        let view = self.resolve_kind(context, source, ObjectKind::is_table, FUNCTION)?;
        let records = match &*view.payload.lock() {
            Payload::Table(table) => table.records(),
            _ => Vec::new(),
        };

        let mut slot = HandleSlot::new(
            context,
            ObjectKind::Cursor,
            Payload::Cursor(CursorData {
                records,
                position: 0,
            }),
        );
        slot.domain = Some(source);
        self.allocate(slot)
    }

    fn open_accessor(&mut self, context: NativeContextId, request: &OpenRequest) -> NativeResult<HandleId> {
        const FUNCTION: &str = "obj_column";

        let source = match request.source {
            Some(source) => source,
            None => return self.fail(context, ReturnCode::InvalidArgument, "accessor needs a table", FUNCTION),
        };
        let view = self.resolve_kind(context, source, ObjectKind::is_table, FUNCTION)?;
        let range = match request.name.as_deref() {
            Some("_key") => view.domain,
            Some("_id") => self.builtins.get("Int32").copied(),
            other => {
                return self.fail(
                    context,
                    ReturnCode::NotFound,
                    format!("no such accessor: <{}>", other.unwrap_or("")),
                    FUNCTION,
                );
            }
        };

        let mut slot = HandleSlot::new(context, ObjectKind::Accessor, Payload::Empty);
        slot.domain = Some(source);
        slot.range = range;
        self.allocate(slot)
    }

    fn value_fits(&self, range: Option<HandleId>, value: &Value) -> bool {
        if matches!(value, Value::Null) {
            return true;
        }
        if let Some(ObjectKind::Table(_)) = self.kind_of_opt(range) {
            return matches!(value, Value::Int(_));
        }
        match (self.name_of(range), value) {
            (Some("Bool"), Value::Bool(_)) => true,
            (Some("Int32"), Value::Int(v)) => i32::try_from(*v).is_ok(),
            (Some("Int64"), Value::Int(_)) => true,
            (Some("Float"), Value::Float(_)) | (Some("Float"), Value::Int(_)) => true,
            (Some("ShortText"), Value::Text(s)) => s.len() <= MAX_SHORT_TEXT_KEY,
            (Some("Text"), Value::Text(_)) | (Some("LongText"), Value::Text(_)) => true,
            _ => false,
        }
    }
}

fn create_database_file(path: &Path) -> std::result::Result<(), (ReturnCode, String)> {
    if path.exists() {
        return Err((ReturnCode::FileExists, format!("already exists: {}", path.display())));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err((
                ReturnCode::NoSuchFileOrDirectory,
                format!("no such directory: {}", parent.display()),
            ));
        }
    }
    std::fs::write(path, DATABASE_MAGIC)
        .map_err(|e| (ReturnCode::UnknownError, format!("{}: {}", path.display(), e)))
}

fn check_database_file(path: &Path) -> std::result::Result<(), (ReturnCode, String)> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.starts_with(DATABASE_MAGIC) => Ok(()),
        Ok(_) => Err((ReturnCode::InvalidArgument, format!("not a database: {}", path.display()))),
        Err(_) => Err((ReturnCode::NoSuchFileOrDirectory, format!("no such file: {}", path.display()))),
    }
}

fn has_finalizer_slot(kind: ObjectKind) -> bool {
    matches!(
        kind,
        ObjectKind::Database
            | ObjectKind::Table(_)
            | ObjectKind::Column(_)
            | ObjectKind::Expression
            | ObjectKind::Snippet
    )
}

fn handle_id_at(index: usize) -> Option<HandleId> {
    u32::try_from(index).ok().map(HandleId)
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().map(str::to_lowercase)
}

/// Reference engine
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    stats: EngineStats,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::new()),
            stats: EngineStats::new(),
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Non-shared handles currently owned by `context`.
    pub fn open_handles(&self, context: NativeContextId) -> usize {
        self.state
            .lock()
            .handles
            .iter()
            .flatten()
            .filter(|slot| slot.context == Some(context))
            .count()
    }

    pub fn is_open(&self, handle: HandleId) -> bool {
        matches!(self.state.lock().handles.get(handle.index()), Some(Some(_)))
    }

    pub fn refcount(&self, handle: HandleId) -> Option<u32> {
        self.state
            .lock()
            .handles
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.refcount)
    }

    pub fn has_finalizer(&self, handle: HandleId) -> bool {
        self.state
            .lock()
            .handles
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .map_or(false, |slot| slot.finalizer.is_some())
    }

    /// Creates a handle carrying a type tag outside the binding's known set,
    /// the way a newer engine build could.
    pub fn open_foreign(&self, context: NativeContextId, tag: u8) -> NativeResult<HandleId> {
        let mut state = self.state.lock();
        state.enter(context)?;
        let mut slot = HandleSlot::new(context, ObjectKind::Expression, Payload::Empty);
        slot.tag = tag;
        state.allocate(slot)
    }

    fn fire(&self, pending: Pending) {
        for (event, finalizer) in pending {
            self.stats.finalizers_fired.fetch_add(1, Ordering::Relaxed);
            finalizer(event);
        }
    }
}

impl NativeEngine for MemoryEngine {
    fn context_init(&self, options: &ContextOptions) -> NativeResult<NativeContextId> {
        self.stats.call();
        let mut state = self.state.lock();
        if state.finalized {
            return Err(ReturnCode::OperationNotPermitted);
        }
        let id = NativeContextId(state.next_context);
        state.next_context += 1;
        state.contexts.insert(
            id,
            ContextSlot {
                options: options.clone(),
                last_error: LastError::default(),
                by_name: AHashMap::new(),
                database: None,
            },
        );
        Ok(id)
    }

    fn context_fin(&self, context: NativeContextId) {
        self.stats.call();
        let pending = {
            let mut state = self.state.lock();
            if state.finalized || !state.contexts.contains_key(&context) {
                return;
            }
            state.reclaim_context(context, &self.stats)
        };
        self.fire(pending);
    }

    fn context_last_error(&self, context: NativeContextId) -> LastError {
        self.stats.call();
        let state = self.state.lock();
        match state.contexts.get(&context) {
            Some(slot) if !state.finalized => slot.last_error.clone(),
            _ => LastError {
                rc: ReturnCode::ObjectClosed,
                message: "context is already finalized".to_string(),
                ..LastError::default()
            },
        }
    }

    fn handle_open(&self, context: NativeContextId, request: &OpenRequest) -> NativeResult<HandleId> {
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        state.open(context, request)
    }

    fn handle_lookup(&self, context: NativeContextId, name: &str) -> NativeResult<Option<HandleId>> {
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        state.lookup(context, name, "ctx_get")
    }

    fn handle_info(&self, context: NativeContextId, handle: HandleId) -> NativeResult<HandleInfo> {
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let info = state.slot(context, handle).map(|slot| HandleInfo {
            type_tag: slot.tag,
            name: slot.name.clone(),
            domain: slot.domain,
            range: slot.range,
            flags: slot.flags,
        });
        match info {
            Some(info) => Ok(info),
            None if state.was_released(handle) => state.fail(
                context,
                ReturnCode::ObjectClosed,
                format!("object {} was closed", handle),
                "obj_info",
            ),
            None => state.fail(
                context,
                ReturnCode::NotFound,
                format!("no such object: {}", handle),
                "obj_info",
            ),
        }
    }

    fn handle_close(&self, context: NativeContextId, handle: HandleId) -> NativeResult<()> {
        self.stats.call();
        let pending = {
            let mut state = self.state.lock();
            state.enter(context)?;
            let view = state.resolve(context, handle, "obj_close")?;
            if view.builtin {
                self.stats.shared_close_attempts.fetch_add(1, Ordering::Relaxed);
                return state.fail(
                    context,
                    ReturnCode::OperationNotPermitted,
                    "shared objects cannot be closed",
                    "obj_close",
                );
            }
            let slot = state.release(handle);
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
            slot.and_then(|slot| EngineState::event(context, handle, slot))
        };
        self.fire(pending.into_iter().collect());
        Ok(())
    }

    fn handle_unlink(&self, context: NativeContextId, handle: HandleId) {
        self.stats.call();
        let pending = {
            let mut state = self.state.lock();
            if state.enter(context).is_err() {
                return;
            }
            let release = match state.slot_mut(context, handle) {
                Some(slot) if slot.context.is_some() => {
                    slot.refcount = slot.refcount.saturating_sub(1);
                    slot.refcount == 0 && !slot.flags.persistent
                }
                _ => false,
            };
            if !release {
                return;
            }
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
            state
                .release(handle)
                .and_then(|slot| EngineState::event(context, handle, slot))
        };
        self.fire(pending.into_iter().collect());
    }

    fn set_finalizer(&self, context: NativeContextId, handle: HandleId, finalizer: Finalizer) -> bool {
        self.stats.call();
        let mut state = self.state.lock();
        if state.enter(context).is_err() {
            return false;
        }
        match state.slot_mut(context, handle) {
            Some(slot) if slot.context.is_some() => {
                let supported = ObjectKind::from_tag(slot.tag).map_or(false, has_finalizer_slot);
                if supported {
                    slot.finalizer = Some(finalizer);
                }
                supported
            }
            _ => false,
        }
    }

    fn set_user_data(&self, context: NativeContextId, handle: HandleId, data: UserData) -> NativeResult<()> {
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        match state.slot_mut(context, handle) {
            Some(slot) => {
                slot.user_data = Some(data);
                Ok(())
            }
            None => state.fail(
                context,
                ReturnCode::NotFound,
                format!("no such object: {}", handle),
                "obj_user_data",
            ),
        }
    }

    fn get_user_data(&self, context: NativeContextId, handle: HandleId) -> NativeResult<Option<UserData>> {
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        match state.slot(context, handle) {
            Some(slot) => Ok(slot.user_data),
            None => state.fail(
                context,
                ReturnCode::NotFound,
                format!("no such object: {}", handle),
                "obj_user_data",
            ),
        }
    }

    fn fin(&self) {
        self.stats.call();
        let pending = {
            let mut state = self.state.lock();
            if state.finalized {
                return;
            }
            let contexts: Vec<NativeContextId> = state.contexts.keys().copied().collect();
            let mut pending = Vec::new();
            for context in contexts {
                pending.extend(state.reclaim_context(context, &self.stats));
            }
            state.finalized = true;
            pending
        };
        self.fire(pending);
    }

    fn table_add(&self, context: NativeContextId, table: HandleId, key: &[u8]) -> NativeResult<(RecordId, bool)> {
        const FUNCTION: &str = "table_add";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, table, ObjectKind::is_table, FUNCTION)?;
        let mut payload = view.payload.lock();
        let data = match &mut *payload {
            Payload::Table(data) => data,
            _ => return state.fail(context, ReturnCode::UnknownError, "corrupt table", FUNCTION),
        };

        if !data.keyed {
            if !key.is_empty() {
                return state.fail(context, ReturnCode::InvalidArgument, "array tables have no keys", FUNCTION);
            }
            return Ok(data.add(key));
        }
        if key.is_empty() {
            return state.fail(context, ReturnCode::InvalidArgument, "empty key", FUNCTION);
        }
        let utf8 = state
            .contexts
            .get(&context)
            .map_or(false, |slot| slot.options.encoding == Encoding::Utf8);
        if utf8 && std::str::from_utf8(key).is_err() {
            return state.fail(context, ReturnCode::InvalidArgument, "invalid UTF-8 key", FUNCTION);
        }
        if state.name_of(view.domain) == Some("ShortText") && key.len() > MAX_SHORT_TEXT_KEY {
            return state.fail(
                context,
                ReturnCode::InvalidArgument,
                format!("too long key: {} > {}", key.len(), MAX_SHORT_TEXT_KEY),
                FUNCTION,
            );
        }
        Ok(data.add(key))
    }

    fn table_get(&self, context: NativeContextId, table: HandleId, key: &[u8]) -> NativeResult<Option<RecordId>> {
        const FUNCTION: &str = "table_get";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, table, ObjectKind::is_table, FUNCTION)?;
        let payload = view.payload.lock();
        match &*payload {
            Payload::Table(data) if data.keyed => Ok(data.ids.get(key).copied()),
            _ => state.fail(context, ReturnCode::InvalidArgument, "table has no keys", FUNCTION),
        }
    }

    fn table_delete(&self, context: NativeContextId, table: HandleId, key: &[u8]) -> NativeResult<bool> {
        const FUNCTION: &str = "table_delete";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, table, ObjectKind::is_table, FUNCTION)?;
        let mut payload = view.payload.lock();
        match &mut *payload {
            Payload::Table(data) if data.keyed => Ok(data.delete(key)),
            _ => state.fail(context, ReturnCode::InvalidArgument, "table has no keys", FUNCTION),
        }
    }

    fn table_key(&self, context: NativeContextId, table: HandleId, record: RecordId) -> NativeResult<Option<Vec<u8>>> {
        const FUNCTION: &str = "table_get_key";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, table, ObjectKind::is_table, FUNCTION)?;
        let payload = view.payload.lock();
        match &*payload {
            Payload::Table(data) => Ok(data.key(record)),
            _ => state.fail(context, ReturnCode::UnknownError, "corrupt table", FUNCTION),
        }
    }

    fn table_size(&self, context: NativeContextId, table: HandleId) -> NativeResult<u64> {
        const FUNCTION: &str = "table_size";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, table, ObjectKind::is_table, FUNCTION)?;
        let payload = view.payload.lock();
        match &*payload {
            Payload::Table(data) => Ok(data.live),
            _ => state.fail(context, ReturnCode::UnknownError, "corrupt table", FUNCTION),
        }
    }

    fn column_set(&self, context: NativeContextId, column: HandleId, record: RecordId, value: &Value) -> NativeResult<()> {
        const FUNCTION: &str = "obj_set_value";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, column, ObjectKind::is_column, FUNCTION)?;

        let exists = match view.domain.and_then(|table| state.slot(context, table)) {
            Some(table) => match &*table.payload.lock() {
                Payload::Table(data) => data.key(record).is_some(),
                _ => false,
            },
            None => false,
        };
        if !exists {
            return state.fail(context, ReturnCode::NotFound, format!("no such record: {}", record.0), FUNCTION);
        }

        let range = state.slot(context, column).and_then(|slot| slot.range);
        if !state.value_fits(range, value) {
            let message = format!(
                "value {:?} does not fit <{}>",
                value,
                state.name_of(range).unwrap_or("?")
            );
            return state.fail(context, ReturnCode::InvalidArgument, message, FUNCTION);
        }

        let mut payload = view.payload.lock();
        match &mut *payload {
            Payload::Column(data) => {
                match value {
                    Value::Null => data.values.remove(&record),
                    other => data.values.insert(record, other.clone()),
                };
                Ok(())
            }
            _ => state.fail(context, ReturnCode::InvalidArgument, "not a data column", FUNCTION),
        }
    }

    fn column_get(&self, context: NativeContextId, column: HandleId, record: RecordId) -> NativeResult<Value> {
        const FUNCTION: &str = "obj_get_value";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, column, ObjectKind::is_column, FUNCTION)?;
        let payload = view.payload.lock();
        match &*payload {
            Payload::Column(data) => Ok(data.values.get(&record).cloned().unwrap_or(Value::Null)),
            _ => state.fail(context, ReturnCode::InvalidArgument, "not a data column", FUNCTION),
        }
    }

    fn index_add(&self, context: NativeContextId, index: HandleId, record: RecordId, text: &str) -> NativeResult<()> {
        const FUNCTION: &str = "column_index_update";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, index, ObjectKind::is_column, FUNCTION)?;
        let mut payload = view.payload.lock();
        match &mut *payload {
            Payload::Index(data) => {
                for term in tokenize(text) {
                    data.postings.entry(term).or_default().insert(record);
                }
                Ok(())
            }
            _ => state.fail(context, ReturnCode::InvalidArgument, "not an index column", FUNCTION),
        }
    }

    fn index_search(&self, context: NativeContextId, index: HandleId, query: &str) -> NativeResult<Vec<RecordId>> {
        const FUNCTION: &str = "obj_search";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, index, ObjectKind::is_column, FUNCTION)?;
        let payload = view.payload.lock();
        let data = match &*payload {
            Payload::Index(data) => data,
            _ => return state.fail(context, ReturnCode::InvalidArgument, "not an index column", FUNCTION),
        };

        let mut result: Option<BTreeSet<RecordId>> = None;
        for term in tokenize(query) {
            let postings = data.postings.get(&term).cloned().unwrap_or_default();
            result = Some(match result {
                Some(current) => current.intersection(&postings).copied().collect(),
                None => postings,
            });
        }
        match result {
            Some(records) => Ok(records.into_iter().collect()),
            None => state.fail(context, ReturnCode::InvalidArgument, "empty query", FUNCTION),
        }
    }

    fn cursor_next(&self, context: NativeContextId, cursor: HandleId) -> NativeResult<Option<RecordId>> {
        const FUNCTION: &str = "table_cursor_next";
        self.stats.call();
        let mut state = self.state.lock();
        state.enter(context)?;
        let view = state.resolve_kind(context, cursor, |kind| kind == ObjectKind::Cursor, FUNCTION)?;
        let mut payload = view.payload.lock();
        match &mut *payload {
            Payload::Cursor(data) => {
                let next = data.records.get(data.position).copied();
                if next.is_some() {
                    data.position += 1;
                }
                Ok(next)
            }
            _ => state.fail(context, ReturnCode::UnknownError, "corrupt cursor", FUNCTION),
        }
    }
}
