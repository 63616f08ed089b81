//! novusdb query engine: cost-based planner and executor over pre-built
//! query trees.
//!
//! This crate never parses SQL. It consumes a [`ast::Statement`] — built by
//! an external lexer/parser — resolves tables and indexes against a
//! [`novusdb_storage::Pager`], consults [`planner`] and the per-table
//! statistics gathered by `ANALYZE` to pick a scan/join strategy, and drives
//! [`executor`] to produce an [`query_api::Outcome`].
//!
//! # Architecture
//!
//! - `ast` — the query tree shape (`Statement`, `Select`, `Expr`, hints).
//! - `evaluator` — scalar expression evaluation, wildcard paths, the scalar
//!   function library.
//! - `planner` — scan/join strategy selection and selectivity estimation.
//! - `constraints` / `sequence` — the constraint and sequence catalogues.
//! - `executor` — the physical operators (scan, filter, join, aggregate,
//!   sort, DML, DDL) driven by `query_api::Database::execute`.

pub mod ast;
pub mod constraints;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod planner;
pub mod query_api;
pub mod sequence;

pub use error::{Error, Result};
pub use evaluator::Value;
pub use query_api::{Database, Outcome, Params};
