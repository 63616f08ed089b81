//! Constraint catalogue: primary keys, uniqueness and foreign keys, persisted
//! as documents in the hidden `_novusdb_constraints` collection and loaded
//! into an in-memory cache at open, the way `novusdb_storage::stats` persists
//! `ANALYZE` results.

use novusdb_storage::document::{Document, FieldValue};
use novusdb_storage::pager::Pager;
use novusdb_storage::Result as StorageResult;

use crate::ast::OnDelete;
use crate::error::Result;

pub const CONSTRAINTS_COLLECTION: &str = "_novusdb_constraints";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub table: String,
    pub columns: Vec<String>,
    pub ref_table: Option<String>,
    pub ref_column: Option<String>,
    pub on_delete: Option<OnDelete>,
}

fn kind_to_str(kind: ConstraintKind) -> &'static str {
    match kind {
        ConstraintKind::PrimaryKey => "PRIMARY_KEY",
        ConstraintKind::Unique => "UNIQUE",
        ConstraintKind::ForeignKey => "FOREIGN_KEY",
    }
}

fn kind_from_str(s: &str) -> Option<ConstraintKind> {
    match s {
        "PRIMARY_KEY" => Some(ConstraintKind::PrimaryKey),
        "UNIQUE" => Some(ConstraintKind::Unique),
        "FOREIGN_KEY" => Some(ConstraintKind::ForeignKey),
        _ => None,
    }
}

fn on_delete_to_str(v: OnDelete) -> &'static str {
    match v {
        OnDelete::Restrict => "RESTRICT",
        OnDelete::Cascade => "CASCADE",
        OnDelete::SetNull => "SET_NULL",
        OnDelete::NoAction => "NO_ACTION",
    }
}

fn on_delete_from_str(s: &str) -> Option<OnDelete> {
    match s {
        "RESTRICT" => Some(OnDelete::Restrict),
        "CASCADE" => Some(OnDelete::Cascade),
        "SET_NULL" => Some(OnDelete::SetNull),
        "NO_ACTION" => Some(OnDelete::NoAction),
        _ => None,
    }
}

impl Constraint {
    fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.push("name", FieldValue::String(self.name.clone()));
        doc.push("type", FieldValue::String(kind_to_str(self.kind).to_string()));
        doc.push("table", FieldValue::String(self.table.clone()));
        doc.push(
            "columns",
            FieldValue::Array(self.columns.iter().cloned().map(FieldValue::String).collect()),
        );
        doc.push(
            "ref_table",
            self.ref_table.clone().map(FieldValue::String).unwrap_or(FieldValue::Null),
        );
        doc.push(
            "ref_column",
            self.ref_column.clone().map(FieldValue::String).unwrap_or(FieldValue::Null),
        );
        doc.push(
            "on_delete",
            match self.on_delete {
                Some(v) => FieldValue::String(on_delete_to_str(v).to_string()),
                None => FieldValue::Null,
            },
        );
        doc
    }

    fn from_document(doc: &Document) -> Option<Self> {
        let name = match doc.get("name")? {
            FieldValue::String(s) => s.clone(),
            _ => return None,
        };
        let kind = match doc.get("type")? {
            FieldValue::String(s) => kind_from_str(s)?,
            _ => return None,
        };
        let table = match doc.get("table")? {
            FieldValue::String(s) => s.clone(),
            _ => return None,
        };
        let columns = match doc.get("columns")? {
            FieldValue::Array(items) => items
                .iter()
                .filter_map(|v| match v {
                    FieldValue::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => return None,
        };
        let ref_table = match doc.get("ref_table") {
            Some(FieldValue::String(s)) => Some(s.clone()),
            _ => None,
        };
        let ref_column = match doc.get("ref_column") {
            Some(FieldValue::String(s)) => Some(s.clone()),
            _ => None,
        };
        let on_delete = match doc.get("on_delete") {
            Some(FieldValue::String(s)) => on_delete_from_str(s),
            _ => None,
        };

        Some(Self {
            name,
            kind,
            table,
            columns,
            ref_table,
            ref_column,
            on_delete,
        })
    }
}

#[derive(Default)]
pub struct ConstraintCatalogue {
    cache: Vec<Constraint>,
}

impl ConstraintCatalogue {
    pub fn load(pager: &Pager) -> Result<Self> {
        if !pager.collection_exists(CONSTRAINTS_COLLECTION) {
            return Ok(Self::default());
        }
        let rows = pager.scan_collection(CONSTRAINTS_COLLECTION)?;
        let mut cache = Vec::with_capacity(rows.len());
        for (_, bytes) in rows {
            if let Ok(doc) = Document::decode(&bytes) {
                if let Some(c) = Constraint::from_document(&doc) {
                    cache.push(c);
                }
            }
        }
        Ok(Self { cache })
    }

    pub fn for_table(&self, table: &str) -> impl Iterator<Item = &Constraint> {
        self.cache.iter().filter(move |c| c.table == table)
    }

    pub fn primary_key(&self, table: &str) -> Option<&Constraint> {
        self.for_table(table).find(|c| c.kind == ConstraintKind::PrimaryKey)
    }

    pub fn unique_constraints(&self, table: &str) -> impl Iterator<Item = &Constraint> {
        self.for_table(table)
            .filter(|c| matches!(c.kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique))
    }

    pub fn foreign_keys_on(&self, table: &str) -> impl Iterator<Item = &Constraint> {
        self.for_table(table).filter(|c| c.kind == ConstraintKind::ForeignKey)
    }

    /// Foreign keys elsewhere that reference `table`, for delete-time
    /// cascade/restrict/set-null enforcement.
    pub fn foreign_keys_referencing(&self, table: &str) -> impl Iterator<Item = &Constraint> {
        self.cache
            .iter()
            .filter(move |c| c.kind == ConstraintKind::ForeignKey && c.ref_table.as_deref() == Some(table))
    }

    pub fn add(&mut self, pager: &mut Pager, constraint: Constraint) -> Result<()> {
        let bytes = constraint.to_document().encode();
        pager.insert_record(CONSTRAINTS_COLLECTION, &bytes)?;
        pager.end_statement()?;
        self.cache.push(constraint);
        Ok(())
    }

    pub fn drop_for_table(&mut self, pager: &mut Pager, table: &str) -> StorageResult<()> {
        if !pager.collection_exists(CONSTRAINTS_COLLECTION) {
            return Ok(());
        }
        for (loc, bytes) in pager.scan_collection(CONSTRAINTS_COLLECTION)? {
            if let Ok(doc) = Document::decode(&bytes) {
                if let Some(FieldValue::String(t)) = doc.get("table") {
                    if t == table {
                        pager.mark_deleted(loc)?;
                    }
                }
            }
        }
        pager.end_statement()?;
        self.cache.retain(|c| c.table != table);
        Ok(())
    }
}
