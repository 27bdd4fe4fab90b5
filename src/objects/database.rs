use std::path::Path;

use tracing::info;

use super::object_wrapper;
use crate::context::Context;
use crate::error::Result;
use crate::kind::ObjectKind;
use crate::options::ObjectOptions;

object_wrapper!(
    /// Database. A context works against at most one at a time.
    Database,
    "Database",
    |kind| kind == ObjectKind::Database
);

impl Database {
    /// Creates a database, on disk when `path` is given, and associates it
    /// with `context`.
    pub fn create(context: &Context, path: Option<&Path>) -> Result<Database> {
        let mut options = ObjectOptions::new(ObjectKind::Database);
        if let Some(path) = path {
            options = options.path(path);
        }
        let database = Self::open_with(context, &options)?;
        if let Some(path) = path {
            info!("Created database at {}", path.display());
        }
        Ok(database)
    }

    /// Opens an existing on-disk database.
    pub fn open(context: &Context, path: &Path) -> Result<Database> {
        let options = ObjectOptions::new(ObjectKind::Database).path(path).open_existing();
        Self::open_with(context, &options)
    }

    fn open_with(context: &Context, options: &ObjectOptions) -> Result<Database> {
        let object = context.open_object(options, |object| context.attach_database(object))?;
        Database::try_from(object)
    }
}
