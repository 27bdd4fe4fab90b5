use super::{object_wrapper, Table};
use crate::error::{Error, Result};
use crate::finalizer::Resources;
use crate::kind::{ColumnKind, ObjectKind};
use crate::native::{NativeResult, RecordId, ReturnCode, Value};

object_wrapper!(
    /// Fixed or variable size data column.
    Column,
    "Column",
    |kind| matches!(
        kind,
        ObjectKind::Column(ColumnKind::Fixed) | ObjectKind::Column(ColumnKind::Variable)
    )
);

object_wrapper!(
    /// Full-text index column.
    IndexColumn,
    "IndexColumn",
    |kind| kind == ObjectKind::Column(ColumnKind::Index)
);

impl Column {
    pub fn set(&self, record: RecordId, value: &Value) -> Result<()> {
        let (context, native, handle) = self.live()?;
        let result = context.engine().column_set(native, handle, record, value);
        context.check(result, Some(self.as_object()))
    }

    pub fn get(&self, record: RecordId) -> Result<Value> {
        let (context, native, handle) = self.live()?;
        let result = context.engine().column_get(native, handle, record);
        context.check(result, Some(self.as_object()))
    }

    /// Table the column belongs to.
    pub fn table(&self) -> Result<Table> {
        owning_table(self.as_object())
    }
}

impl IndexColumn {
    /// Indexes `text` as the content of `record`.
    pub fn add(&self, record: RecordId, text: &str) -> Result<()> {
        let (context, native, handle) = self.live()?;
        let result = context.engine().index_add(native, handle, record, text);
        context.check(result, Some(self.as_object()))
    }

    /// Records containing every term of `query`.
    pub fn search(&self, query: &str) -> Result<Vec<RecordId>> {
        let (context, native, handle) = self.live()?;
        let result = self.with_resources(|resources| -> NativeResult<Vec<RecordId>> {
            let (scratch, postings) = match resources {
                Resources::IndexColumn { query: scratch, postings } => (scratch, postings),
                _ => return Err(ReturnCode::UnknownError),
            };
            scratch.clear();
            for (i, term) in query.split_whitespace().enumerate() {
                if i > 0 {
                    scratch.push(' ');
                }
                scratch.push_str(term);
            }
            postings.clear();
            let found = context.engine().index_search(native, handle, scratch)?;
            postings.extend_from_slice(&found);
            Ok(found)
        });
        context.check(result, Some(self.as_object()))
    }

    /// Result of the last `search`.
    pub fn last_postings(&self) -> Vec<RecordId> {
        self.with_resources(|resources| match resources {
            Resources::IndexColumn { postings, .. } => postings.clone(),
            _ => Vec::new(),
        })
    }

    pub fn table(&self) -> Result<Table> {
        owning_table(self.as_object())
    }
}

fn owning_table(column: &crate::object::Object) -> Result<Table> {
    match column.domain()? {
        Some(table) => Table::try_from(table),
        None => Err(Error::TypeMismatch {
            expected: "Table".to_string(),
            actual: "no domain".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextOptions;
    use crate::context::Context;
    use crate::kind::TableKind;
    use crate::native::MemoryEngine;
    use crate::options::ObjectOptions;
    use crate::shutdown::ShutdownCoordinator;
    use std::sync::Arc;

    fn documents() -> (Context, Table) {
        let engine = Arc::new(MemoryEngine::new());
        let context = Context::new(engine, ShutdownCoordinator::new(), ContextOptions::default()).unwrap();
        let options = ObjectOptions::table(TableKind::Hash)
            .key_type("ShortText")
            .name("Documents");
        let table = Table::create(&context, &options).unwrap();
        (context, table)
    }

    #[test]
    fn test_set_get_value() {
        let (_context, table) = documents();
        let score = table.create_column("score", "Int32").unwrap();
        assert_eq!(score.kind(), ObjectKind::Column(ColumnKind::Fixed));
        assert_eq!(score.name().as_deref(), Some("Documents.score"));

        let (doc, _) = table.add("doc1").unwrap();
        score.set(doc, &Value::Int(42)).unwrap();
        assert_eq!(score.get(doc).unwrap(), Value::Int(42));

        let err = score.set(doc, &Value::Text("many".to_string())).unwrap_err();
        assert_eq!(err.code(), Some(ReturnCode::InvalidArgument.code()));
        assert!(err.to_string().contains("does not fit <Int32>"));
        assert!(score.table().unwrap().ptr_eq(&table));
    }

    #[test]
    fn test_index_search_uses_scratch() {
        let (_context, table) = documents();
        let index = table.create_index("body").unwrap();
        let (first, _) = table.add("doc1").unwrap();
        let (second, _) = table.add("doc2").unwrap();
        index.add(first, "Rust binding lifetimes").unwrap();
        index.add(second, "binding layers").unwrap();

        assert_eq!(index.search("  binding  ").unwrap(), vec![first, second]);
        assert_eq!(index.search("rust binding").unwrap(), vec![first]);
        assert_eq!(index.last_postings(), vec![first]);
    }

    #[test]
    fn test_lookup_column_by_short_name() {
        let (_context, table) = documents();
        let title = table.create_column("title", "ShortText").unwrap();
        let found = table.column("title").unwrap().unwrap();
        assert!(found.ptr_eq(&title));
        assert!(Column::try_from(found).is_ok());
        assert!(IndexColumn::try_from(title.into_object()).is_err());
    }
}
