//! Validated option sets for opening engine objects.

use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::kind::{ColumnKind, ObjectKind, TableKind};
use crate::native::{HandleFlags, HandleId, OpenRequest};
use crate::object::Object;

/// Something an option refers to: an object by name, or a wrapper.
#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Object(Object),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<&Object> for Target {
    fn from(object: &Object) -> Self {
        Target::Object(object.clone())
    }
}

/// Builder for `Object::open`.
///
/// ```ignore
/// let options = ObjectOptions::table(TableKind::Hash)
///     .name("Users")
///     .persistent()
///     .key_type("ShortText");
/// ```
#[derive(Debug, Clone)]
pub struct ObjectOptions {
    kind: ObjectKind,
    name: Option<String>,
    path: Option<PathBuf>,
    persistent: bool,
    with_subrec: bool,
    domain: Option<Target>,
    range: Option<Target>,
    source: Option<Target>,
    create: bool,
}

impl ObjectOptions {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            name: None,
            path: None,
            persistent: false,
            with_subrec: false,
            domain: None,
            range: None,
            source: None,
            create: true,
        }
    }

    pub fn table(kind: TableKind) -> Self {
        Self::new(ObjectKind::Table(kind))
    }

    pub fn column(kind: ColumnKind) -> Self {
        Self::new(ObjectKind::Column(kind))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Storage path; implies a persistent object.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self.persistent = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_subrec(mut self) -> Self {
        self.with_subrec = true;
        self
    }

    /// Key type of a table, or owning table of a column.
    pub fn domain(mut self, target: impl Into<Target>) -> Self {
        self.domain = Some(target.into());
        self
    }

    pub fn key_type(self, type_name: &str) -> Self {
        self.domain(type_name)
    }

    /// Value type of a table or column.
    pub fn range(mut self, target: impl Into<Target>) -> Self {
        self.range = Some(target.into());
        self
    }

    pub fn value_type(self, type_name: &str) -> Self {
        self.range(type_name)
    }

    /// Table a cursor or accessor reads from.
    pub fn source(mut self, target: impl Into<Target>) -> Self {
        self.source = Some(target.into());
        self
    }

    /// Open an existing object instead of creating a new one.
    pub fn open_existing(mut self) -> Self {
        self.create = false;
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Checks the option set is complete and consistent for its kind.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(Error::InvalidArgument(format!("invalid name: {:?}", name)));
            }
        }

        match self.kind {
            ObjectKind::Type | ObjectKind::Procedure => {
                return Err(Error::InvalidArgument(format!(
                    "{} objects are builtin and cannot be opened",
                    self.kind
                )));
            }
            ObjectKind::Database => {
                if self.name.is_some() {
                    return Err(Error::InvalidArgument("databases are not named".to_string()));
                }
                if !self.create && self.path.is_none() {
                    return Err(Error::InvalidArgument(
                        "opening an existing database needs a path".to_string(),
                    ));
                }
            }
            ObjectKind::Table(TableKind::Array) => {
                if self.domain.is_some() {
                    return Err(Error::InvalidArgument("array tables have no key type".to_string()));
                }
            }
            ObjectKind::Table(_) => {
                if self.domain.is_none() && self.create {
                    return Err(Error::InvalidArgument("key type is required".to_string()));
                }
            }
            ObjectKind::Column(kind) => {
                if self.create && self.domain.is_none() {
                    return Err(Error::InvalidArgument("column needs an owning table".to_string()));
                }
                if self.create && kind != ColumnKind::Index && self.range.is_none() {
                    return Err(Error::InvalidArgument("value type is required".to_string()));
                }
            }
            ObjectKind::Cursor | ObjectKind::Accessor => {
                if self.source.is_none() {
                    return Err(Error::InvalidArgument(format!("{} needs a source table", self.kind)));
                }
            }
            ObjectKind::Expression | ObjectKind::Snippet => {}
        }

        if self.kind != ObjectKind::Database {
            if self.path.is_some() {
                return Err(Error::InvalidArgument(format!("{} objects take no path", self.kind)));
            }
            if self.persistent && self.name.is_none() {
                return Err(Error::InvalidArgument("persistent objects need a name".to_string()));
            }
        }
        if !self.create && self.kind != ObjectKind::Database && self.name.is_none() {
            return Err(Error::InvalidArgument("opening an existing object needs a name".to_string()));
        }

        Ok(())
    }

    /// Resolves targets against `context` and builds the engine request.
    ///
    /// The wrappers the targets resolved to come back alongside the request;
    /// the handles in the request stay valid only while they are held.
    pub(crate) fn to_request(&self, context: &Context) -> Result<(OpenRequest, Vec<Object>)> {
        let mut request = OpenRequest::new(self.kind);
        request.name = self.name.clone();
        request.path = self.path.clone();
        request.flags = HandleFlags {
            persistent: self.persistent,
            with_subrec: self.with_subrec,
        };
        request.create = self.create;

        let mut referents = Vec::new();
        request.domain = resolve(context, self.domain.as_ref(), &mut referents)?;
        request.range = resolve(context, self.range.as_ref(), &mut referents)?;
        request.source = resolve(context, self.source.as_ref(), &mut referents)?;
        Ok((request, referents))
    }
}

// Names go through `Context::lookup` so an object that is already open keeps
// its single wrapper and its native reference count is left as it was.
fn resolve(context: &Context, target: Option<&Target>, referents: &mut Vec<Object>) -> Result<Option<HandleId>> {
    let object = match target {
        None => return Ok(None),
        Some(Target::Name(name)) => match context.lookup(name)? {
            Some(object) => object,
            None => return Err(Error::InvalidArgument(format!("unknown object: <{}>", name))),
        },
        Some(Target::Object(object)) => object.clone(),
    };
    let (owner, _, handle) = object.live()?;
    if !owner.ptr_eq(context) {
        return Err(Error::InvalidArgument(format!(
            "{} belongs to another context",
            object.describe()
        )));
    }
    referents.push(object);
    Ok(Some(handle))
}
