//! MantisDB Binding Core
//!
//! Object lifetime bridge between a garbage-collected host runtime and the
//! MantisDB storage/search engine. Native handles are owned by native
//! contexts; the host holds wrapper objects. This crate keeps both lifetimes
//! consistent: every handle is released exactly once, whether the host closes
//! it, the host drops it, or the engine tears its context down first.

#![allow(clippy::missing_safety_doc)]

pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod ffi;
mod finalizer;
mod floating;
pub mod kind;
pub mod logging;
pub mod native;
pub mod object;
pub mod objects;
pub mod options;
pub mod shutdown;

pub use binding::Binding;
pub use config::{BindingConfig, ContextOptions, Encoding, LoggingConfig};
pub use context::{Context, LifecycleStats};
pub use error::{Error, Location, Result};
pub use kind::{ColumnKind, ObjectKind, TableKind};
pub use native::{HandleId, MemoryEngine, NativeEngine, RecordId, ReturnCode, Value};
pub use object::Object;
pub use objects::{Accessor, Column, Cursor, Database, IndexColumn, Table};
pub use options::{ObjectOptions, Target};
pub use shutdown::ShutdownCoordinator;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
