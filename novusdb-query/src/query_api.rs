//! Top-level handle: opens a database file and dispatches pre-built
//! [`crate::ast::Statement`] trees to the executor. This is the one type
//! callers outside this crate construct directly.

use std::collections::BTreeMap;
use std::path::Path;

use log::debug;
use novusdb_storage::pager::DbOptions;
use novusdb_storage::{Document, Pager};

use crate::ast::Statement;
use crate::constraints::ConstraintCatalogue;
use crate::error::{Error, Result};
use crate::evaluator::Value;
use crate::executor::{self, ExecCtx};
use crate::sequence::SequenceCatalogue;
use novusdb_storage::stats::StatsCatalogue;

/// Bind parameters for a statement, referenced in expressions as `$name`.
#[derive(Debug, Clone, Default)]
pub struct Params {
    inner: BTreeMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.inner.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner.get(name)
    }
}

/// Result of executing one statement: any rows it produced (`SELECT`,
/// `EXPLAIN`), the count of rows it touched (DML), and the record id of the
/// last row inserted (single-row `INSERT` / upsert only).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub docs: Vec<Document>,
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// An open database: the page store plus the three catalogues kept in sync
/// with it (constraints, sequences, column statistics). One `Database`
/// drives every statement against a single file.
pub struct Database {
    pager: Pager,
    constraints: ConstraintCatalogue,
    sequences: SequenceCatalogue,
    stats: StatsCatalogue,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, DbOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let pager = Pager::open(path, options)?;
        let constraints = ConstraintCatalogue::load(&pager)?;
        let sequences = SequenceCatalogue::load(&pager)?;
        let stats = StatsCatalogue::load(&pager)?;
        Ok(Self { pager, constraints, sequences, stats })
    }

    pub fn execute(&mut self, statement: &Statement) -> Result<Outcome> {
        self.execute_with_params(statement, &Params::new())
    }

    pub fn execute_with_params(&mut self, statement: &Statement, params: &Params) -> Result<Outcome> {
        let mut ctx = ExecCtx {
            pager: &mut self.pager,
            sequences: &mut self.sequences,
            stats: &mut self.stats,
            constraints: &mut self.constraints,
            params,
        };
        Self::dispatch(&mut ctx, statement)
    }

    fn dispatch(ctx: &mut ExecCtx, statement: &Statement) -> Result<Outcome> {
        match statement {
            Statement::Select(select) => executor::execute_select(ctx, select),
            Statement::Union { left, right, all } => executor::execute_union(ctx, left, right, *all),
            Statement::Insert(insert) => executor::execute_insert(ctx, insert),
            Statement::Update(update) => executor::execute_update(ctx, update),
            Statement::Delete(delete) => executor::execute_delete(ctx, delete),
            Statement::Explain(inner) => match inner.as_ref() {
                Statement::Select(select) => executor::execute_explain(ctx, select),
                other => Self::dispatch(ctx, other),
            },

            Statement::CreateIndex { name, table, field, if_not_exists } => {
                debug!("creating index on {table}.{field}");
                ctx.pager.create_index(name.clone(), table, field, *if_not_exists)?;
                Ok(Outcome::default())
            }
            Statement::DropIndex { name, table, field, if_exists } => {
                match (name, table, field) {
                    (Some(n), _, _) => ctx.pager.drop_index_by_name(n, *if_exists)?,
                    (None, Some(t), Some(f)) => ctx.pager.drop_index_by_field(t, f, *if_exists)?,
                    _ => return Err(Error::InvalidArgument("DROP INDEX needs either a name or a table+field".to_string())),
                }
                Ok(Outcome::default())
            }

            Statement::CreateView { name, source_text } => {
                ctx.pager.create_view(name, source_text)?;
                Ok(Outcome::default())
            }
            Statement::DropView { name, if_exists } => {
                ctx.pager.drop_view(name, *if_exists)?;
                Ok(Outcome::default())
            }

            Statement::DropTable { table, if_exists } => {
                ctx.pager.drop_collection(table, *if_exists)?;
                ctx.constraints.drop_for_table(ctx.pager, table)?;
                Ok(Outcome::default())
            }
            Statement::TruncateTable { table } => executor::execute_truncate(ctx, table),

            Statement::Analyze { table } => executor::execute_analyze(ctx, table.as_deref()),
            Statement::AlterTable { table, constraint } => executor::execute_alter_table(ctx, table, constraint),

            Statement::CreateSequence { name, start, increment, min, max, cycle } => {
                ctx.sequences.create(ctx.pager, name, *start, *increment, *min, *max, *cycle)?;
                Ok(Outcome::default())
            }
            Statement::DropSequence { name, if_exists } => {
                ctx.sequences.drop(ctx.pager, name, *if_exists)?;
                Ok(Outcome::default())
            }

            Statement::Begin => {
                ctx.pager.begin()?;
                Ok(Outcome::default())
            }
            Statement::Commit => {
                ctx.pager.commit()?;
                Ok(Outcome::default())
            }
            Statement::Rollback => {
                ctx.pager.rollback()?;
                Ok(Outcome::default())
            }
        }
    }

    /// Returns the stored query text for a registered view, for a caller to
    /// re-parse and expand into its own `FROM` clause. This crate never
    /// parses SQL itself, so a view's body can't be inlined here.
    pub fn view_source(&self, name: &str) -> Option<&str> {
        self.pager.view(name).map(|v| v.query_text.as_str())
    }

    pub fn in_transaction(&self) -> bool {
        self.pager.in_transaction()
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.pager.checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expr, Insert, InsertSource, Literal, Select, SelectItem};
    use tempfile::tempdir;

    fn insert_row(table: &str, fields: &[(&str, Expr)]) -> Statement {
        Statement::Insert(Insert {
            table: table.to_string(),
            source: InsertSource::Values(vec![fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()]),
            or_replace: false,
        })
    }

    #[test]
    fn insert_then_select_round_trips_a_row() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();

        db.execute(&insert_row(
            "users",
            &[("name", Expr::Literal(Literal::String("Ada".to_string()))), ("age", Expr::Literal(Literal::Int64(30)))],
        ))
        .unwrap();

        let select = Statement::Select(Select {
            columns: vec![SelectItem::Wildcard { qualifier: None }],
            from: "users".to_string(),
            ..Default::default()
        });
        let outcome = db.execute(&select).unwrap();
        assert_eq!(outcome.docs.len(), 1);
        assert_eq!(outcome.docs[0].get("name"), Some(&novusdb_storage::FieldValue::String("Ada".to_string())));
    }

    #[test]
    fn filter_excludes_non_matching_rows() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();
        db.execute(&insert_row("users", &[("age", Expr::Literal(Literal::Int64(20)))])).unwrap();
        db.execute(&insert_row("users", &[("age", Expr::Literal(Literal::Int64(40)))])).unwrap();

        let select = Statement::Select(Select {
            columns: vec![SelectItem::Wildcard { qualifier: None }],
            from: "users".to_string(),
            filter: Some(Expr::Binary {
                op: BinaryOp::Gt,
                left: Box::new(Expr::Path { qualifier: None, path: "age".to_string() }),
                right: Box::new(Expr::Literal(Literal::Int64(30))),
            }),
            ..Default::default()
        });
        let outcome = db.execute(&select).unwrap();
        assert_eq!(outcome.docs.len(), 1);
    }

    #[test]
    fn create_index_then_equality_lookup_uses_it() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();
        db.execute(&insert_row("users", &[("email", Expr::Literal(Literal::String("a@x.com".to_string())))])).unwrap();
        db.execute(&Statement::CreateIndex { name: None, table: "users".to_string(), field: "email".to_string(), if_not_exists: false })
            .unwrap();

        let select = Statement::Select(Select {
            columns: vec![SelectItem::Wildcard { qualifier: None }],
            from: "users".to_string(),
            filter: Some(Expr::Binary {
                op: BinaryOp::Eq,
                left: Box::new(Expr::Path { qualifier: None, path: "email".to_string() }),
                right: Box::new(Expr::Literal(Literal::String("a@x.com".to_string()))),
            }),
            ..Default::default()
        });
        let outcome = db.execute(&select).unwrap();
        assert_eq!(outcome.docs.len(), 1);
    }

    #[test]
    fn transaction_rollback_discards_inserts() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();
        db.execute(&Statement::Begin).unwrap();
        db.execute(&insert_row("users", &[("name", Expr::Literal(Literal::String("Temp".to_string())))])).unwrap();
        db.execute(&Statement::Rollback).unwrap();

        let select =
            Statement::Select(Select { columns: vec![SelectItem::Wildcard { qualifier: None }], from: "users".to_string(), ..Default::default() });
        let outcome = db.execute(&select).unwrap();
        assert_eq!(outcome.docs.len(), 0);
    }

    #[test]
    fn analyze_populates_stats_used_by_the_planner() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();
        for i in 0..5 {
            db.execute(&insert_row("items", &[("price", Expr::Literal(Literal::Int64(i)))])).unwrap();
        }
        let outcome = db.execute(&Statement::Analyze { table: Some("items".to_string()) }).unwrap();
        assert_eq!(outcome.rows_affected, 1);
    }

    #[test]
    fn sequence_nextval_persists_across_statements() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();
        db.execute(&Statement::CreateSequence { name: "ids".to_string(), start: 1, increment: 1, min: 1, max: 1000, cycle: false })
            .unwrap();
        db.execute(&insert_row("widgets", &[("id", Expr::Sequence { name: "ids".to_string(), op: crate::ast::SequenceOp::NextVal })]))
            .unwrap();
        db.execute(&insert_row("widgets", &[("id", Expr::Sequence { name: "ids".to_string(), op: crate::ast::SequenceOp::NextVal })]))
            .unwrap();

        let select =
            Statement::Select(Select { columns: vec![SelectItem::Wildcard { qualifier: None }], from: "widgets".to_string(), ..Default::default() });
        let outcome = db.execute(&select).unwrap();
        let ids: Vec<i64> = outcome
            .docs
            .iter()
            .map(|d| match d.get("id") {
                Some(novusdb_storage::FieldValue::Int64(i)) => *i,
                _ => 0,
            })
            .collect();
        assert!(ids.contains(&1) && ids.contains(&2));
    }
}
