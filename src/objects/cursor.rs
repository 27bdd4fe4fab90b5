use super::{object_wrapper, Table};
use crate::error::{Error, Result};
use crate::kind::ObjectKind;
use crate::native::RecordId;

object_wrapper!(
    /// Forward cursor over a snapshot of a table's records.
    Cursor,
    "TableCursor",
    |kind| kind == ObjectKind::Cursor
);

object_wrapper!(
    /// Pseudo column reading a record's key or id.
    Accessor,
    "Accessor",
    |kind| kind == ObjectKind::Accessor
);

impl Cursor {
    pub fn next(&self) -> Result<Option<RecordId>> {
        let (context, native, handle) = self.live()?;
        let result = context.engine().cursor_next(native, handle);
        context.check(result, Some(self.as_object()))
    }

    /// Remaining records; the cursor is exhausted afterwards.
    pub fn collect_records(&self) -> Result<Vec<RecordId>> {
        let mut records = Vec::new();
        while let Some(record) = self.next()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl Accessor {
    /// Table the accessor reads from.
    pub fn table(&self) -> Result<Table> {
        match self.domain()? {
            Some(table) => Table::try_from(table),
            None => Err(Error::TypeMismatch {
                expected: "Table".to_string(),
                actual: "no domain".to_string(),
            }),
        }
    }
}
