//! Typed wrappers over `Object`.
//!
//! Each wrapper is a newtype that derefs to `Object`, so the lifecycle
//! operations (`close`, `unlink`, `is_closed`, ...) are shared, and adds the
//! forwarding calls that make sense for its kind.

mod column;
mod cursor;
mod database;
mod table;

pub use column::{Column, IndexColumn};
pub use cursor::{Accessor, Cursor};
pub use database::Database;
pub use table::Table;

macro_rules! object_wrapper {
    ($(#[$meta:meta])* $name:ident, $expected:literal, $accepts:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name {
            object: $crate::object::Object,
        }

        impl $name {
            pub fn as_object(&self) -> &$crate::object::Object {
                &self.object
            }

            pub fn into_object(self) -> $crate::object::Object {
                self.object
            }
        }

        impl std::ops::Deref for $name {
            type Target = $crate::object::Object;

            fn deref(&self) -> &Self::Target {
                &self.object
            }
        }

        impl TryFrom<$crate::object::Object> for $name {
            type Error = $crate::error::Error;

            fn try_from(object: $crate::object::Object) -> $crate::error::Result<Self> {
                let kind = object.kind();
                let accepts: fn($crate::kind::ObjectKind) -> bool = $accepts;
                if accepts(kind) {
                    Ok(Self { object })
                } else {
                    Err($crate::error::Error::TypeMismatch {
                        expected: $expected.to_string(),
                        actual: kind.to_string(),
                    })
                }
            }
        }
    };
}

pub(crate) use object_wrapper;
