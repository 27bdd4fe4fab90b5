//! Contract of the wrapped storage/search engine.
//!
//! Everything behind `NativeEngine` is owned by the engine: contexts, handles,
//! reference counts, finalizer slots and user-data slots. The binding only ever
//! talks to it through this trait, the same way a C binding talks to the
//! engine's public API.
//!
//! Every fallible call returns `NativeResult` and also records the failure in
//! the context's last-error slot, which `Context::check_error` reads.

pub mod memory;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ContextOptions;
use crate::kind::ObjectKind;

pub use memory::{EngineStats, MemoryEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeContextId(pub u64);

/// Small dense handle id; usable directly as an arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl HandleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u32);

/// Opaque per-handle slot the binding uses to find its wrapper again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserData(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnCode {
    #[default]
    Success,
    EndOfData,
    UnknownError,
    OperationNotPermitted,
    NoSuchFileOrDirectory,
    NoMemoryAvailable,
    FileExists,
    InvalidArgument,
    ObjectClosed,
    NotFound,
}

impl ReturnCode {
    pub const fn code(self) -> i32 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::EndOfData => 1,
            ReturnCode::UnknownError => -1,
            ReturnCode::OperationNotPermitted => -2,
            ReturnCode::NoSuchFileOrDirectory => -3,
            ReturnCode::NoMemoryAvailable => -12,
            ReturnCode::FileExists => -17,
            ReturnCode::InvalidArgument => -22,
            ReturnCode::ObjectClosed => -70,
            ReturnCode::NotFound => -71,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ReturnCode::Success | ReturnCode::EndOfData)
    }
}

pub type NativeResult<T> = std::result::Result<T, ReturnCode>;

/// Last failure recorded on a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastError {
    pub rc: ReturnCode,
    pub message: String,
    pub file: Option<String>,
    pub line: u32,
    pub function: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleFlags {
    /// Backed by storage and reachable by name from any context
    pub persistent: bool,
    pub with_subrec: bool,
}

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub kind: ObjectKind,
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub flags: HandleFlags,
    pub domain: Option<HandleId>,
    pub range: Option<HandleId>,
    /// Target of a cursor or accessor
    pub source: Option<HandleId>,
    /// Create the backing storage instead of opening an existing one
    pub create: bool,
}

impl OpenRequest {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            name: None,
            path: None,
            flags: HandleFlags::default(),
            domain: None,
            range: None,
            source: None,
            create: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub type_tag: u8,
    pub name: Option<String>,
    pub domain: Option<HandleId>,
    pub range: Option<HandleId>,
    pub flags: HandleFlags,
}

/// Column cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeEvent {
    pub context: NativeContextId,
    pub handle: HandleId,
    pub user_data: Option<UserData>,
}

/// Called by the engine when it releases a handle on its own.
pub type Finalizer = Arc<dyn Fn(FinalizeEvent) + Send + Sync>;

pub trait NativeEngine: Send + Sync {
    fn context_init(&self, options: &ContextOptions) -> NativeResult<NativeContextId>;

    /// Releases every handle the context still owns, firing their finalizers.
    fn context_fin(&self, context: NativeContextId);

    fn context_last_error(&self, context: NativeContextId) -> LastError;

    fn handle_open(&self, context: NativeContextId, request: &OpenRequest) -> NativeResult<HandleId>;

    fn handle_lookup(&self, context: NativeContextId, name: &str) -> NativeResult<Option<HandleId>>;

    fn handle_info(&self, context: NativeContextId, handle: HandleId) -> NativeResult<HandleInfo>;

    fn handle_close(&self, context: NativeContextId, handle: HandleId) -> NativeResult<()>;

    /// Reference count decrement. A temporary handle reaching zero is closed.
    fn handle_unlink(&self, context: NativeContextId, handle: HandleId);

    /// Returns false when the handle kind has no finalizer slot.
    fn set_finalizer(&self, context: NativeContextId, handle: HandleId, finalizer: Finalizer) -> bool;

    fn set_user_data(&self, context: NativeContextId, handle: HandleId, data: UserData) -> NativeResult<()>;

    fn get_user_data(&self, context: NativeContextId, handle: HandleId) -> NativeResult<Option<UserData>>;

    /// Process-wide teardown. Every context is finalized.
    fn fin(&self);

    fn table_add(&self, context: NativeContextId, table: HandleId, key: &[u8]) -> NativeResult<(RecordId, bool)>;

    fn table_get(&self, context: NativeContextId, table: HandleId, key: &[u8]) -> NativeResult<Option<RecordId>>;

    fn table_delete(&self, context: NativeContextId, table: HandleId, key: &[u8]) -> NativeResult<bool>;

    fn table_key(&self, context: NativeContextId, table: HandleId, record: RecordId) -> NativeResult<Option<Vec<u8>>>;

    fn table_size(&self, context: NativeContextId, table: HandleId) -> NativeResult<u64>;

    fn column_set(&self, context: NativeContextId, column: HandleId, record: RecordId, value: &Value) -> NativeResult<()>;

    fn column_get(&self, context: NativeContextId, column: HandleId, record: RecordId) -> NativeResult<Value>;

    fn index_add(&self, context: NativeContextId, index: HandleId, record: RecordId, text: &str) -> NativeResult<()>;

    fn index_search(&self, context: NativeContextId, index: HandleId, query: &str) -> NativeResult<Vec<RecordId>>;

    fn cursor_next(&self, context: NativeContextId, cursor: HandleId) -> NativeResult<Option<RecordId>>;
}
