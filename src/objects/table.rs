use tracing::debug;

use super::{object_wrapper, Accessor, Column, Cursor, IndexColumn};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::finalizer::Resources;
use crate::kind::{ColumnKind, ObjectKind};
use crate::native::RecordId;
use crate::object::Object;
use crate::options::ObjectOptions;

object_wrapper!(
    /// Hash, patricia trie, double array trie or array table.
    Table,
    "Table",
    ObjectKind::is_table
);

const FIXED_SIZE_TYPES: [&str; 4] = ["Bool", "Int32", "Int64", "Float"];

impl Table {
    /// Creates a table from a table option set.
    pub fn create(context: &Context, options: &ObjectOptions) -> Result<Table> {
        if !options.kind().is_table() {
            return Err(Error::InvalidArgument(format!("{} is not a table kind", options.kind())));
        }
        let object = context.open_object(options, |_| Ok(()))?;
        Table::try_from(object)
    }

    /// Adds `key` unless present. Returns the record and whether it is new.
    pub fn add(&self, key: &str) -> Result<(RecordId, bool)> {
        let (context, native, handle) = self.live()?;
        let result = self.with_key(key, |key| context.engine().table_add(native, handle, key));
        context.check(result, Some(self.as_object()))
    }

    /// Adds a record to an array table.
    pub fn push(&self) -> Result<RecordId> {
        self.add("").map(|(record, _)| record)
    }

    pub fn get(&self, key: &str) -> Result<Option<RecordId>> {
        let (context, native, handle) = self.live()?;
        let result = self.with_key(key, |key| context.engine().table_get(native, handle, key));
        context.check(result, Some(self.as_object()))
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let (context, native, handle) = self.live()?;
        let result = self.with_key(key, |key| context.engine().table_delete(native, handle, key));
        context.check(result, Some(self.as_object()))
    }

    pub fn key(&self, record: RecordId) -> Result<Option<String>> {
        let (context, native, handle) = self.live()?;
        let result = context.engine().table_key(native, handle, record);
        let key = context.check(result, Some(self.as_object()))?;
        Ok(key.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn size(&self) -> Result<u64> {
        let (context, native, handle) = self.live()?;
        let result = context.engine().table_size(native, handle);
        context.check(result, Some(self.as_object()))
    }

    /// Opens a cursor over the records present now.
    pub fn open_cursor(&self) -> Result<Cursor> {
        let (context, _, _) = self.live()?;
        let options = ObjectOptions::new(ObjectKind::Cursor).source(self.as_object());
        let object = context.open_object(&options, |_| Ok(()))?;
        Cursor::try_from(object)
    }

    /// Runs `f` for every record; the cursor is closed afterwards even when
    /// `f` fails.
    pub fn each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(RecordId) -> Result<()>,
    {
        let (context, _, _) = self.live()?;
        let options = ObjectOptions::new(ObjectKind::Cursor).source(self.as_object());
        context.with_object(&options, |cursor| {
            let cursor = Cursor::try_from(cursor.clone())?;
            while let Some(record) = cursor.next()? {
                f(record)?;
            }
            Ok(())
        })
    }

    /// Accessor for the record key (`_key`) or id (`_id`).
    pub fn accessor(&self, name: &str) -> Result<Accessor> {
        let (context, _, _) = self.live()?;
        let options = ObjectOptions::new(ObjectKind::Accessor)
            .name(name)
            .source(self.as_object());
        let object = context.open_object(&options, |_| Ok(()))?;
        Accessor::try_from(object)
    }

    pub fn key_accessor(&self) -> Result<Accessor> {
        self.accessor("_key")
    }

    /// Creates a data column. Persistent tables get persistent columns named
    /// `Table.column`.
    pub fn create_column(&self, name: &str, value_type: &str) -> Result<Column> {
        let kind = if FIXED_SIZE_TYPES.contains(&value_type) {
            ColumnKind::Fixed
        } else {
            ColumnKind::Variable
        };
        let options = self.column_options(kind, name).value_type(value_type);
        let object = self.open_column(&options)?;
        Column::try_from(object)
    }

    pub fn create_index(&self, name: &str) -> Result<IndexColumn> {
        let options = self.column_options(ColumnKind::Index, name);
        let object = self.open_column(&options)?;
        IndexColumn::try_from(object)
    }

    /// Column of this table by its short name. Columns of anonymous tables
    /// are anonymous too and cannot be looked up.
    pub fn column(&self, name: &str) -> Result<Option<Object>> {
        let (context, _, _) = self.live()?;
        match self.column_name(name) {
            Some(full_name) => context.lookup(&full_name),
            None => Ok(None),
        }
    }

    fn column_name(&self, name: &str) -> Option<String> {
        self.name().map(|table| format!("{}.{}", table, name))
    }

    fn column_options(&self, kind: ColumnKind, name: &str) -> ObjectOptions {
        let mut options = ObjectOptions::column(kind).domain(self.as_object());
        if let Some(full_name) = self.column_name(name) {
            options = options.name(full_name);
        }
        if self.is_persistent() {
            options = options.persistent();
        }
        options
    }

    fn open_column(&self, options: &ObjectOptions) -> Result<Object> {
        let (context, _, _) = self.live()?;
        let object = context.open_object(options, |_| Ok(()))?;
        debug!("Created column {}", object.describe());
        Ok(object)
    }

    /// Encodes `key` into the table's key buffer and runs `f` on it.
    fn with_key<R>(&self, key: &str, f: impl FnOnce(&[u8]) -> R) -> R {
        self.with_resources(|resources| match resources {
            Resources::Table { key_buffer } => {
                key_buffer.clear();
                key_buffer.extend_from_slice(key.as_bytes());
                f(key_buffer)
            }
            _ => f(key.as_bytes()),
        })
    }
}
