//! Closed set of engine object kinds.
//!
//! The engine reports a raw type tag for every handle. Anything outside this
//! set is rejected with `Error::UnsupportedHandleKind` so a newer engine can
//! never hand the binding an object it does not know how to tear down.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Hash,
    PatriciaTrie,
    DoubleArrayTrie,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Fixed,
    Variable,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Database,
    Type,
    Procedure,
    Table(TableKind),
    Column(ColumnKind),
    Accessor,
    Cursor,
    Expression,
    Snippet,
}

impl ObjectKind {
    pub const fn tag(self) -> u8 {
        match self {
            ObjectKind::Database => 0x37,
            ObjectKind::Type => 0x20,
            ObjectKind::Procedure => 0x21,
            ObjectKind::Table(TableKind::Hash) => 0x30,
            ObjectKind::Table(TableKind::PatriciaTrie) => 0x31,
            ObjectKind::Table(TableKind::DoubleArrayTrie) => 0x32,
            ObjectKind::Table(TableKind::Array) => 0x33,
            ObjectKind::Column(ColumnKind::Fixed) => 0x40,
            ObjectKind::Column(ColumnKind::Variable) => 0x41,
            ObjectKind::Column(ColumnKind::Index) => 0x48,
            ObjectKind::Accessor => 0x09,
            ObjectKind::Cursor => 0x10,
            ObjectKind::Expression => 0x22,
            ObjectKind::Snippet => 0x0b,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        let kind = match tag {
            0x37 => ObjectKind::Database,
            0x20 => ObjectKind::Type,
            0x21 => ObjectKind::Procedure,
            0x30 => ObjectKind::Table(TableKind::Hash),
            0x31 => ObjectKind::Table(TableKind::PatriciaTrie),
            0x32 => ObjectKind::Table(TableKind::DoubleArrayTrie),
            0x33 => ObjectKind::Table(TableKind::Array),
            0x40 => ObjectKind::Column(ColumnKind::Fixed),
            0x41 => ObjectKind::Column(ColumnKind::Variable),
            0x48 => ObjectKind::Column(ColumnKind::Index),
            0x09 => ObjectKind::Accessor,
            0x10 => ObjectKind::Cursor,
            0x22 => ObjectKind::Expression,
            0x0b => ObjectKind::Snippet,
            other => return Err(Error::UnsupportedHandleKind(other)),
        };
        Ok(kind)
    }

    /// Types and procedures are shared engine state; closing one from a
    /// wrapper would break every other user of it.
    pub fn need_close(self) -> bool {
        !matches!(self, ObjectKind::Type | ObjectKind::Procedure)
    }

    /// Accessors have no native finalizer slot but still own wrapper-side
    /// state that must be torn down like a finalized object.
    pub fn implicit_finalizer(self) -> bool {
        matches!(self, ObjectKind::Accessor)
    }

    pub fn is_table(self) -> bool {
        matches!(self, ObjectKind::Table(_))
    }

    pub fn is_column(self) -> bool {
        matches!(self, ObjectKind::Column(_))
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Database => "Database",
            ObjectKind::Type => "Type",
            ObjectKind::Procedure => "Procedure",
            ObjectKind::Table(TableKind::Hash) => "Hash",
            ObjectKind::Table(TableKind::PatriciaTrie) => "PatriciaTrie",
            ObjectKind::Table(TableKind::DoubleArrayTrie) => "DoubleArrayTrie",
            ObjectKind::Table(TableKind::Array) => "Array",
            ObjectKind::Column(ColumnKind::Fixed) => "FixSizeColumn",
            ObjectKind::Column(ColumnKind::Variable) => "VariableSizeColumn",
            ObjectKind::Column(ColumnKind::Index) => "IndexColumn",
            ObjectKind::Accessor => "Accessor",
            ObjectKind::Cursor => "TableCursor",
            ObjectKind::Expression => "Expression",
            ObjectKind::Snippet => "Snippet",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ObjectKind; 14] = [
        ObjectKind::Database,
        ObjectKind::Type,
        ObjectKind::Procedure,
        ObjectKind::Table(TableKind::Hash),
        ObjectKind::Table(TableKind::PatriciaTrie),
        ObjectKind::Table(TableKind::DoubleArrayTrie),
        ObjectKind::Table(TableKind::Array),
        ObjectKind::Column(ColumnKind::Fixed),
        ObjectKind::Column(ColumnKind::Variable),
        ObjectKind::Column(ColumnKind::Index),
        ObjectKind::Accessor,
        ObjectKind::Cursor,
        ObjectKind::Expression,
        ObjectKind::Snippet,
    ];

    #[test]
    fn test_tags_are_distinct_and_resolve() {
        let mut tags: Vec<u8> = ALL.iter().map(|k| k.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), ALL.len());

        for kind in ALL {
            assert_eq!(ObjectKind::from_tag(kind.tag()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_tag() {
        match ObjectKind::from_tag(0x7f) {
            Err(Error::UnsupportedHandleKind(0x7f)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_shared_kinds_are_never_closed() {
        assert!(!ObjectKind::Type.need_close());
        assert!(!ObjectKind::Procedure.need_close());
        assert!(ObjectKind::Table(TableKind::Hash).need_close());
        assert!(ObjectKind::Accessor.implicit_finalizer());
        assert!(!ObjectKind::Cursor.implicit_finalizer());
    }
}
