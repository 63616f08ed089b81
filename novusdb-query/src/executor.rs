//! Physical execution: scans, joins, aggregation, sorting and the DML/DDL
//! statement handlers that `query_api::Database::execute` dispatches to.
//! Everything here is keyed on a single `ExecCtx` borrow of the engine's
//! mutable state for one statement at a time.

use novusdb_storage::index::encode_sortable_key;
use novusdb_storage::stats::{Bound, ColumnStats, HistogramBucket, StatsCatalogue, TableStats, DEFAULT_HISTOGRAM_BUCKETS};
use novusdb_storage::{CollectionMeta, Document, FieldValue, IndexMeta, Pager, RecordLocation};

use crate::ast::{BinaryOp, ConstraintDef, Delete, Expr, HintItem, Insert, InsertSource, Literal, OnDelete, Select, SelectItem, SortDirection, Update};
use crate::constraints::{Constraint, ConstraintCatalogue, ConstraintKind};
use crate::error::{Error, Result};
use crate::evaluator::{self, eval, is_aggregate_call, EvalEnv, RowCtx, Value};
use crate::planner::{self, JoinStrategy};
use crate::query_api::{Outcome, Params};
use crate::sequence::SequenceCatalogue;

/// One row flowing through the pipeline: every live table binding, keyed by
/// its alias (or bare table name when unaliased).
#[derive(Clone)]
pub struct Row {
    pub tables: Vec<(String, Document)>,
}

impl Row {
    fn single(alias: &str, doc: Document) -> Self {
        Self { tables: vec![(alias.to_string(), doc)] }
    }

    fn table_refs(&self) -> Vec<(&str, &Document)> {
        self.tables.iter().map(|(n, d)| (n.as_str(), d)).collect()
    }
}

fn row_ctx<'a>(row: &'a Row, outer: Option<&'a RowCtx<'a>>) -> RowCtx<'a> {
    match outer {
        Some(o) => RowCtx::with_parent(row.table_refs(), o),
        None => RowCtx::new(row.table_refs()),
    }
}

/// Borrows everything a statement needs: the Pager plus the three in-memory
/// catalogues and the caller's bind parameters. Built fresh per statement by
/// `query_api::Database::execute`.
pub struct ExecCtx<'a> {
    pub pager: &'a mut Pager,
    pub sequences: &'a mut SequenceCatalogue,
    pub stats: &'a mut StatsCatalogue,
    pub constraints: &'a mut ConstraintCatalogue,
    pub params: &'a Params,
}

impl EvalEnv for ExecCtx<'_> {
    fn parameter(&self, name: &str) -> Result<Value> {
        self.params.get(name).cloned().ok_or_else(|| Error::InvalidArgument(format!("unbound parameter ${name}")))
    }

    fn sequence_nextval(&mut self, name: &str) -> Result<i64> {
        self.sequences.nextval(self.pager, name)
    }

    fn sequence_currval(&self, name: &str) -> Result<i64> {
        self.sequences.currval(name)
    }

    fn eval_scalar_subquery(&mut self, select: &Select, outer: &RowCtx) -> Result<Value> {
        let docs = run_select(self, select, Some(outer))?.0;
        Ok(docs
            .into_iter()
            .next()
            .and_then(|d| d.fields().next().map(|(_, v)| Value::from_field_value(v)))
            .unwrap_or(Value::Null))
    }

    fn eval_in_subquery(&mut self, select: &Select, outer: &RowCtx) -> Result<Vec<Value>> {
        let docs = run_select(self, select, Some(outer))?.0;
        Ok(docs
            .iter()
            .map(|d| d.fields().next().map(|(_, v)| Value::from_field_value(v)).unwrap_or(Value::Null))
            .collect())
    }
}

// ---------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------

/// Per-statement explain trace, surfaced by the `EXPLAIN` statement.
#[derive(serde::Serialize)]
pub struct ExplainInfo {
    pub scan: Vec<(String, String)>,
    pub joins: Vec<(String, &'static str)>,
    pub selectivity: Vec<(String, f64)>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

fn literal_to_field_value(lit: &Literal) -> FieldValue {
    match lit {
        Literal::Null => FieldValue::Null,
        Literal::String(s) => FieldValue::String(s.clone()),
        Literal::Int64(i) => FieldValue::Int64(*i),
        Literal::Float64(f) => FieldValue::Float64(*f),
        Literal::Bool(b) => FieldValue::Bool(*b),
    }
}

enum IndexOp {
    Eq(Literal),
    In(Vec<Literal>),
}

fn qualifies(qualifier: Option<&str>, alias: &str, table: &str) -> bool {
    match qualifier {
        Some(q) => q == alias || q == table,
        None => true,
    }
}

fn flatten_and<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    if let Expr::And(l, r) = expr {
        flatten_and(l, out);
        flatten_and(r, out);
    } else {
        out.push(expr);
    }
}

/// Looks for a single equality or `IN` conjunct over an indexed column, so
/// the scan can narrow via `Pager::index_lookup` instead of a full scan.
/// Range predicates always fall back to full scan plus filter (correct,
/// just not index-accelerated; the B-tree's `range` call is an optional
/// optimization this engine doesn't take).
fn find_indexable_conjunct(
    filter: &Expr,
    alias: &str,
    table: &str,
    pager: &Pager,
    force_index: Option<&str>,
) -> Option<(String, IndexOp)> {
    let mut conjuncts = Vec::new();
    flatten_and(filter, &mut conjuncts);
    for c in conjuncts {
        match c {
            Expr::Binary { op: BinaryOp::Eq, left, right } => {
                let pair = match (left.as_ref(), right.as_ref()) {
                    (Expr::Path { qualifier, path }, Expr::Literal(lit)) => Some((qualifier, path, lit)),
                    (Expr::Literal(lit), Expr::Path { qualifier, path }) => Some((qualifier, path, lit)),
                    _ => None,
                };
                if let Some((qualifier, path, lit)) = pair {
                    if qualifies(qualifier.as_deref(), alias, table)
                        && (pager.find_index(table, path).is_some() || force_index == Some(path.as_str()))
                    {
                        return Some((path.clone(), IndexOp::Eq(lit.clone())));
                    }
                }
            }
            Expr::In { expr, list, negated: false } => {
                if let Expr::Path { qualifier, path } = expr.as_ref() {
                    if qualifies(qualifier.as_deref(), alias, table)
                        && (pager.find_index(table, path).is_some() || force_index == Some(path.as_str()))
                    {
                        let lits: Vec<Literal> =
                            list.iter().filter_map(|e| if let Expr::Literal(l) = e { Some(l.clone()) } else { None }).collect();
                        if lits.len() == list.len() && !lits.is_empty() {
                            return Some((path.clone(), IndexOp::In(lits)));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn index_candidates(pager: &Pager, table: &str, field: &str, op: &IndexOp) -> Result<Vec<RecordLocation>> {
    match op {
        IndexOp::Eq(lit) => {
            let fv = literal_to_field_value(lit);
            match encode_sortable_key(&fv) {
                Some(key) => Ok(pager.index_lookup(table, field, &key)?),
                None => Ok(Vec::new()),
            }
        }
        IndexOp::In(lits) => {
            let mut out = Vec::new();
            for lit in lits {
                let fv = literal_to_field_value(lit);
                if let Some(key) = encode_sortable_key(&fv) {
                    out.extend(pager.index_lookup(table, field, &key)?);
                }
            }
            Ok(out)
        }
    }
}

/// Scans a table (base `FROM`, never a join's right side), returning the
/// decoded documents it read plus a label of the strategy used for
/// `EXPLAIN`. The caller always still applies the full filter afterward:
/// index narrowing only ever shrinks the candidate set, it never replaces
/// predicate evaluation.
fn scan_table(pager: &Pager, table: &str, alias: &str, filter: Option<&Expr>, hints: &[HintItem]) -> Result<(Vec<Document>, String)> {
    let no_cache = hints.contains(&HintItem::NoCache);
    let full_scan_hint = hints.contains(&HintItem::FullScan);
    let force_index = hints.iter().find_map(|h| if let HintItem::ForceIndex(c) = h { Some(c.as_str()) } else { None });

    if !full_scan_hint {
        if let Some(f) = filter {
            if let Some((field, op)) = find_indexable_conjunct(f, alias, table, pager, force_index) {
                let candidates = index_candidates(pager, table, &field, &op)?;
                let row_count = pager.collection(table).map(|c| c.next_record_id).unwrap_or(0);
                let page_count = pager.total_pages() as u64;
                let use_index =
                    force_index.is_some() || planner::should_use_index(Some(candidates.len() as u64), row_count, page_count);
                if use_index {
                    let mut docs = Vec::with_capacity(candidates.len());
                    for loc in candidates {
                        if let Ok(bytes) = pager.read_record(loc) {
                            if let Ok(doc) = Document::decode(&bytes) {
                                docs.push(doc);
                            }
                        }
                    }
                    return Ok((docs, format!("INDEX_LOOKUP({field})")));
                }
            }
        }
    }

    let raw = if no_cache { pager.scan_collection_uncached(table)? } else { pager.scan_collection(table)? };
    let docs = raw.into_iter().filter_map(|(_, bytes)| Document::decode(&bytes).ok()).collect();
    Ok((docs, "FULL_SCAN".to_string()))
}

fn scan_join_table(pager: &Pager, table: &str) -> Result<Vec<Document>> {
    Ok(pager.scan_collection(table)?.into_iter().filter_map(|(_, bytes)| Document::decode(&bytes).ok()).collect())
}

/// Extracts `(left_path, right_path)` from an equi-join `ON` predicate,
/// independent of which side mentions which alias.
fn extract_equi_cols(on: &Expr, left_aliases: &[&str], right_alias: &str) -> Option<(String, String)> {
    if let Expr::Binary { op: BinaryOp::Eq, left, right } = on {
        if let (Expr::Path { qualifier: lq, path: lp }, Expr::Path { qualifier: rq, path: rp }) =
            (left.as_ref(), right.as_ref())
        {
            let l_is_left = lq.as_deref().map(|q| left_aliases.contains(&q)).unwrap_or(true);
            let r_is_right = rq.as_deref() == Some(right_alias);
            if l_is_left && r_is_right {
                return Some((lp.clone(), rp.clone()));
            }
            let l_is_right = lq.as_deref() == Some(right_alias);
            let r_is_left = rq.as_deref().map(|q| left_aliases.contains(&q)).unwrap_or(true);
            if l_is_right && r_is_left {
                return Some((rp.clone(), lp.clone()));
            }
        }
    }
    None
}

fn eval_on(ctx: &mut ExecCtx, on: &Expr, lrow: &Row, right_alias: &str, rdoc: &Document, outer: Option<&RowCtx>) -> Result<bool> {
    let mut tables = lrow.table_refs();
    tables.push((right_alias, rdoc));
    let rc = match outer { Some(o) => RowCtx::with_parent(tables, o), None => RowCtx::new(tables) };
    Ok(eval(on, &rc, ctx)?.truthy())
}

/// Joins `left_rows` against `right_docs` per `kind`, always by evaluating
/// the full `on` predicate for every candidate pairing the chosen strategy
/// narrows down to. `NestedLoop` narrows to nothing (checks every pairing);
/// `HashJoin`/`IndexLookupJoin` narrow to equal-key candidates first. The
/// emitted row set is identical regardless of strategy.
#[allow(clippy::too_many_arguments)]
fn combine_join(
    ctx: &mut ExecCtx,
    left_rows: &[Row],
    right_alias: &str,
    right_table: &str,
    right_docs: &[Document],
    on: &Expr,
    kind: crate::ast::JoinKind,
    strategy: JoinStrategy,
    equi: Option<&(String, String)>,
    outer: Option<&RowCtx>,
) -> Result<Vec<Row>> {
    use crate::ast::JoinKind;
    let mut out = Vec::new();
    let candidates_for = |ctx: &mut ExecCtx, lrow: &Row| -> Result<Vec<Document>> {
        match (strategy, equi) {
            (JoinStrategy::IndexLookupJoin, Some((lpath, rpath))) => {
                let rc = row_ctx(lrow, None);
                let v = eval(&Expr::Path { qualifier: None, path: lpath.clone() }, &rc, ctx)?;
                match encode_sortable_key(&v.to_field_value()) {
                    Some(key) => {
                        let locs = ctx.pager.index_lookup(right_table, rpath, &key)?;
                        let mut docs = Vec::with_capacity(locs.len());
                        for loc in locs {
                            if let Ok(bytes) = ctx.pager.read_record(loc) {
                                if let Ok(d) = Document::decode(&bytes) {
                                    docs.push(d);
                                }
                            }
                        }
                        Ok(docs)
                    }
                    None => Ok(Vec::new()),
                }
            }
            (JoinStrategy::HashJoin, Some((lpath, rpath))) => {
                let rc = row_ctx(lrow, None);
                let v = eval(&Expr::Path { qualifier: None, path: lpath.clone() }, &rc, ctx)?;
                Ok(right_docs.iter().filter(|d| d.get_path(rpath).map(Value::from_field_value) == Some(v.clone())).cloned().collect())
            }
            _ => Ok(right_docs.to_vec()),
        }
    };

    match kind {
        JoinKind::Inner | JoinKind::Left => {
            for lrow in left_rows {
                let candidates = candidates_for(ctx, lrow)?;
                let mut matched = false;
                for rdoc in &candidates {
                    if eval_on(ctx, on, lrow, right_alias, rdoc, outer)? {
                        matched = true;
                        let mut tables = lrow.tables.clone();
                        tables.push((right_alias.to_string(), rdoc.clone()));
                        out.push(Row { tables });
                    }
                }
                if !matched && kind == JoinKind::Left {
                    let mut tables = lrow.tables.clone();
                    tables.push((right_alias.to_string(), Document::new()));
                    out.push(Row { tables });
                }
            }
        }
        JoinKind::Right => {
            let alias_names: Vec<String> = left_rows.first().map(|r| r.tables.iter().map(|(n, _)| n.clone()).collect()).unwrap_or_default();
            for rdoc in right_docs {
                let mut matched = false;
                for lrow in left_rows {
                    if eval_on(ctx, on, lrow, right_alias, rdoc, outer)? {
                        matched = true;
                        let mut tables = lrow.tables.clone();
                        tables.push((right_alias.to_string(), rdoc.clone()));
                        out.push(Row { tables });
                    }
                }
                if !matched {
                    let mut tables: Vec<(String, Document)> = alias_names.iter().map(|n| (n.clone(), Document::new())).collect();
                    tables.push((right_alias.to_string(), rdoc.clone()));
                    out.push(Row { tables });
                }
            }
        }
    }
    Ok(out)
}

struct FromResult {
    rows: Vec<Row>,
    base_scan: (String, String),
    join_info: Vec<(String, &'static str)>,
}

fn run_from(ctx: &mut ExecCtx, select: &Select, outer: Option<&RowCtx>) -> Result<FromResult> {
    let base_alias = select.from_alias.clone().unwrap_or_else(|| select.from.clone());
    let (base_docs, base_strategy) = scan_table(ctx.pager, &select.from, &base_alias, select.filter.as_ref(), &select.hints)?;
    let mut rows: Vec<Row> = base_docs.into_iter().map(|d| Row::single(&base_alias, d)).collect();
    let mut join_info = Vec::new();
    let mut aliases_so_far = vec![base_alias.clone()];

    for join in &select.joins {
        let right_alias = join.alias.clone().unwrap_or_else(|| join.table.clone());
        let right_docs = scan_join_table(ctx.pager, &join.table)?;
        let left_alias_refs: Vec<&str> = aliases_so_far.iter().map(|s| s.as_str()).collect();
        let equi = extract_equi_cols(&join.on, &left_alias_refs, &right_alias);
        let right_has_index = equi.as_ref().map(|(_, rp)| ctx.pager.find_index(&join.table, rp).is_some()).unwrap_or(false);
        let strategy = planner::choose_join_strategy(&select.hints, equi.is_some(), right_has_index);
        rows = combine_join(ctx, &rows, &right_alias, &join.table, &right_docs, &join.on, join.kind, strategy, equi.as_ref(), outer)?;
        join_info.push((join.table.clone(), strategy.cost_formula()));
        aliases_so_far.push(right_alias);
    }

    Ok(FromResult { rows, base_scan: (select.from.clone(), base_strategy), join_info })
}

fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Call { name, .. } if is_aggregate_call(name) => true,
        Expr::Call { args, .. } => args.iter().any(contains_aggregate),
        Expr::Binary { left, right, .. } => contains_aggregate(left) || contains_aggregate(right),
        Expr::And(l, r) | Expr::Or(l, r) => contains_aggregate(l) || contains_aggregate(r),
        Expr::Not(e) => contains_aggregate(e),
        Expr::Case { operand, whens, else_branch } => {
            operand.as_deref().map(contains_aggregate).unwrap_or(false)
                || whens.iter().any(|(c, r)| contains_aggregate(c) || contains_aggregate(r))
                || else_branch.as_deref().map(contains_aggregate).unwrap_or(false)
        }
        _ => false,
    }
}

fn is_aggregated_select(select: &Select) -> bool {
    !select.group_by.is_empty() || select.columns.iter().any(|c| matches!(c, SelectItem::Expr { expr, .. } if contains_aggregate(expr)))
}

/// Aggregate-aware expression evaluation over a whole group of rows: an
/// aggregate call is computed over the group, everything else recurses
/// using the group's representative (first) row.
fn eval_group_expr(expr: &Expr, group: &[Row], ctx: &mut ExecCtx) -> Result<Value> {
    if let Expr::Call { name, args, distinct } = expr {
        if is_aggregate_call(name) {
            return compute_aggregate(name, args, *distinct, group, ctx);
        }
    }
    match expr {
        Expr::Binary { op, left, right } => {
            let l = eval_group_expr(left, group, ctx)?;
            let r = eval_group_expr(right, group, ctx)?;
            evaluator::eval_binary(*op, &l, &r)
        }
        Expr::And(l, r) => {
            let lv = eval_group_expr(l, group, ctx)?;
            if !lv.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_group_expr(r, group, ctx)?.truthy()))
        }
        Expr::Or(l, r) => {
            let lv = eval_group_expr(l, group, ctx)?;
            if lv.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_group_expr(r, group, ctx)?.truthy()))
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_group_expr(inner, group, ctx)?.truthy())),
        Expr::Call { name, args, .. } => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval_group_expr(a, group, ctx)?);
            }
            evaluator::scalar_function(name, &values)
        }
        Expr::Case { operand, whens, else_branch } => {
            let operand_value = match operand {
                Some(e) => Some(eval_group_expr(e, group, ctx)?),
                None => None,
            };
            for (cond, result) in whens {
                let matched = match &operand_value {
                    Some(ov) => evaluator::values_equal(ov, &eval_group_expr(cond, group, ctx)?),
                    None => eval_group_expr(cond, group, ctx)?.truthy(),
                };
                if matched {
                    return eval_group_expr(result, group, ctx);
                }
            }
            match else_branch {
                Some(e) => eval_group_expr(e, group, ctx),
                None => Ok(Value::Null),
            }
        }
        other => {
            let representative = group.first();
            match representative {
                Some(r) => eval(other, &row_ctx(r, None), ctx),
                None => Ok(Value::Null),
            }
        }
    }
}

fn compute_aggregate(name: &str, args: &[Expr], distinct: bool, group: &[Row], ctx: &mut ExecCtx) -> Result<Value> {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "COUNT" => {
            if args.is_empty() {
                return Ok(Value::Int64(group.len() as i64));
            }
            let mut values = Vec::new();
            for r in group {
                let v = eval(&args[0], &row_ctx(r, None), ctx)?;
                if !v.is_null() {
                    values.push(v);
                }
            }
            if distinct {
                let mut seen: Vec<Value> = Vec::new();
                for v in values {
                    if !seen.contains(&v) {
                        seen.push(v);
                    }
                }
                Ok(Value::Int64(seen.len() as i64))
            } else {
                Ok(Value::Int64(values.len() as i64))
            }
        }
        "SUM" | "AVG" => {
            let mut nums = Vec::new();
            let mut all_int = true;
            for r in group {
                let v = eval(&args[0], &row_ctx(r, None), ctx)?;
                if let Some(f) = v.as_f64() {
                    if !matches!(v, Value::Int64(_)) {
                        all_int = false;
                    }
                    nums.push(f);
                }
            }
            if nums.is_empty() {
                return Ok(Value::Null);
            }
            let sum: f64 = nums.iter().sum();
            if upper == "SUM" {
                if all_int {
                    Ok(Value::Int64(sum as i64))
                } else {
                    Ok(Value::Float64(sum))
                }
            } else {
                Ok(Value::Float64(sum / nums.len() as f64))
            }
        }
        "MIN" | "MAX" => {
            let mut best: Option<Value> = None;
            for r in group {
                let v = eval(&args[0], &row_ctx(r, None), ctx)?;
                if v.is_null() {
                    continue;
                }
                best = Some(match best {
                    None => v,
                    Some(cur) => {
                        let cur_better = match (cur.as_f64(), v.as_f64()) {
                            (Some(a), Some(b)) => if upper == "MIN" { a <= b } else { a >= b },
                            _ => match (cur.as_str(), v.as_str()) {
                                (Some(a), Some(b)) => if upper == "MIN" { a <= b } else { a >= b },
                                _ => true,
                            },
                        };
                        if cur_better { cur } else { v }
                    }
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }
        other => Err(Error::InvalidArgument(format!("unknown aggregate {other}"))),
    }
}

fn default_col_name(expr: &Expr) -> String {
    match expr {
        Expr::Path { path, .. } => path.rsplit('.').next().unwrap_or(path).to_string(),
        Expr::Call { name, .. } => name.clone(),
        Expr::Sequence { name, .. } => name.clone(),
        Expr::Parameter(name) => name.clone(),
        _ => "expr".to_string(),
    }
}

fn project_columns(columns: &[SelectItem], wildcard_tables: &[(String, Document)], mut eval_item: impl FnMut(&Expr) -> Result<Value>) -> Result<Document> {
    let mut out = Document::new();
    for item in columns {
        match item {
            SelectItem::Wildcard { qualifier } => match qualifier {
                Some(q) => {
                    if let Some((_, doc)) = wildcard_tables.iter().find(|(n, _)| n == q) {
                        for (k, v) in doc.fields() {
                            out.push(k, v.clone());
                        }
                    }
                }
                None => {
                    for (_, doc) in wildcard_tables {
                        for (k, v) in doc.fields() {
                            out.push(k, v.clone());
                        }
                    }
                }
            },
            SelectItem::Expr { expr, alias } => {
                let v = eval_item(expr)?;
                let name = alias.clone().unwrap_or_else(|| default_col_name(expr));
                out.push(name, v.to_field_value());
            }
        }
    }
    Ok(out)
}

fn value_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x.cmp(y);
    }
    Ordering::Equal
}

/// Runs a `SELECT` and returns its projected rows plus an explain trace.
/// `outer` chains correlation for a subquery call.
pub fn run_select(ctx: &mut ExecCtx, select: &Select, outer: Option<&RowCtx>) -> Result<(Vec<Document>, ExplainInfo)> {
    let from = run_from(ctx, select, outer)?;
    let mut rows = from.rows;

    if let Some(filter) = &select.filter {
        let mut kept = Vec::with_capacity(rows.len());
        for r in rows {
            if eval(filter, &row_ctx(&r, outer), ctx)?.truthy() {
                kept.push(r);
            }
        }
        rows = kept;
    }

    let aggregated = is_aggregated_select(select);
    let mut projected: Vec<(Document, Vec<Value>)> = Vec::new();

    if aggregated {
        let mut groups: Vec<(Vec<Value>, Vec<Row>)> = Vec::new();
        for r in rows {
            let key: Vec<Value> = {
                let mut k = Vec::with_capacity(select.group_by.len());
                for g in &select.group_by {
                    k.push(eval(g, &row_ctx(&r, outer), ctx)?);
                }
                k
            };
            match groups.iter_mut().find(|(k, _)| k == &key) {
                Some((_, members)) => members.push(r),
                None => groups.push((key, vec![r])),
            }
        }
        for (_, members) in groups {
            if let Some(having) = &select.having {
                if !eval_group_expr(having, &members, ctx)?.truthy() {
                    continue;
                }
            }
            let mut order_keys = Vec::with_capacity(select.order_by.len());
            for item in &select.order_by {
                order_keys.push(eval_group_expr(&item.expr, &members, ctx)?);
            }
            let wildcard_tables: Vec<(String, Document)> = members.first().map(|r| r.tables.clone()).unwrap_or_default();
            let members_ref = &members;
            let doc = project_columns(&select.columns, &wildcard_tables, |e| eval_group_expr(e, members_ref, ctx))?;
            projected.push((doc, order_keys));
        }
    } else {
        for r in &rows {
            let rc = row_ctx(r, outer);
            let mut order_keys = Vec::with_capacity(select.order_by.len());
            for item in &select.order_by {
                order_keys.push(eval(&item.expr, &rc, ctx)?);
            }
            let doc = project_columns(&select.columns, &r.tables, |e| eval(e, &rc, ctx))?;
            projected.push((doc, order_keys));
        }
    }

    if select.distinct {
        let mut deduped: Vec<(Document, Vec<Value>)> = Vec::new();
        for (doc, keys) in projected {
            if !deduped.iter().any(|(d, _)| d == &doc) {
                deduped.push((doc, keys));
            }
        }
        projected = deduped;
    }

    if !select.order_by.is_empty() {
        projected.sort_by(|a, b| {
            for (i, item) in select.order_by.iter().enumerate() {
                let ord = value_cmp(&a.1[i], &b.1[i]);
                let ord = if item.direction == SortDirection::Desc { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    let offset = select.offset.unwrap_or(0).max(0) as usize;
    let mut docs: Vec<Document> = projected.into_iter().skip(offset).map(|(d, _)| d).collect();
    if let Some(limit) = select.limit {
        if limit >= 0 {
            docs.truncate(limit as usize);
        }
    }

    let selectivity = select
        .filter
        .as_ref()
        .map(|f| {
            let pk_cols: Vec<String> = ctx.constraints.primary_key(&select.from).map(|c| c.columns.clone()).unwrap_or_default();
            vec![("filter".to_string(), planner::estimate_selectivity(f, ctx.stats.get(&select.from), &pk_cols))]
        })
        .unwrap_or_default();
    let (hits, misses) = ctx.pager.cache_stats();

    let explain = ExplainInfo {
        scan: vec![from.base_scan],
        joins: from.join_info,
        selectivity,
        cache_hits: hits,
        cache_misses: misses,
    };

    Ok((docs, explain))
}

pub fn execute_select(ctx: &mut ExecCtx, select: &Select) -> Result<Outcome> {
    let (docs, _) = run_select(ctx, select, None)?;
    Ok(Outcome { docs, rows_affected: 0, last_insert_id: 0 })
}

pub fn execute_explain(ctx: &mut ExecCtx, select: &Select) -> Result<Outcome> {
    let (docs, info) = run_select(ctx, select, None)?;
    let plan_json = serde_json::to_string(&info).unwrap_or_default();
    let mut out = Document::new();
    out.push("plan_json", FieldValue::String(plan_json));
    out.push("scan", FieldValue::Array(info.scan.into_iter().map(|(t, s)| FieldValue::String(format!("{t}: {s}"))).collect()));
    out.push(
        "joins",
        FieldValue::Array(info.joins.into_iter().map(|(t, f)| FieldValue::String(format!("{t}: {f}"))).collect()),
    );
    out.push(
        "selectivity",
        FieldValue::Array(info.selectivity.into_iter().map(|(k, v)| FieldValue::String(format!("{k}: {v:.4}"))).collect()),
    );
    out.push("cache_hits", FieldValue::Int64(info.cache_hits as i64));
    out.push("cache_misses", FieldValue::Int64(info.cache_misses as i64));
    out.push("rows_returned", FieldValue::Int64(docs.len() as i64));
    Ok(Outcome { docs: vec![out], rows_affected: 0, last_insert_id: 0 })
}

pub fn execute_union(ctx: &mut ExecCtx, left: &Select, right: &Select, all: bool) -> Result<Outcome> {
    let (mut left_docs, _) = run_select(ctx, left, None)?;
    let (right_docs, _) = run_select(ctx, right, None)?;
    if all {
        left_docs.extend(right_docs);
    } else {
        for d in right_docs {
            if !left_docs.contains(&d) {
                left_docs.push(d);
            }
        }
    }
    Ok(Outcome { docs: left_docs, rows_affected: 0, last_insert_id: 0 })
}

// ---------------------------------------------------------------------
// Index maintenance
// ---------------------------------------------------------------------

fn indexes_for(ctx: &ExecCtx, table: &str) -> Vec<IndexMeta> {
    ctx.pager.indexes().iter().filter(|i| i.collection == table).cloned().collect()
}

fn index_insert_for_doc(ctx: &mut ExecCtx, table: &str, doc: &Document, loc: RecordLocation) -> Result<()> {
    let indexes = indexes_for(ctx, table);
    let locks = ctx.pager.lock_manager_arc();
    let _guard = locks.lock_index_set();
    for idx in indexes {
        if let Some(key) = doc.get_path(&idx.field).and_then(encode_sortable_key) {
            ctx.pager.index_insert_entry(table, &idx.field, &key, loc)?;
        }
    }
    Ok(())
}

fn index_remove_for_doc(ctx: &mut ExecCtx, table: &str, doc: &Document, record_id: u64) -> Result<()> {
    let indexes = indexes_for(ctx, table);
    let locks = ctx.pager.lock_manager_arc();
    let _guard = locks.lock_index_set();
    for idx in indexes {
        if let Some(key) = doc.get_path(&idx.field).and_then(encode_sortable_key) {
            ctx.pager.index_remove_entry(table, &idx.field, &key, record_id)?;
        }
    }
    Ok(())
}

fn sync_indexes_on_update(ctx: &mut ExecCtx, table: &str, old_doc: &Document, new_doc: &Document, loc: RecordLocation) -> Result<()> {
    let indexes = indexes_for(ctx, table);
    let locks = ctx.pager.lock_manager_arc();
    let _guard = locks.lock_index_set();
    for idx in indexes {
        let old_key = old_doc.get_path(&idx.field).and_then(encode_sortable_key);
        let new_key = new_doc.get_path(&idx.field).and_then(encode_sortable_key);
        if old_key != new_key {
            if let Some(k) = old_key {
                ctx.pager.index_remove_entry(table, &idx.field, &k, loc.record_id)?;
            }
            if let Some(k) = new_key {
                ctx.pager.index_insert_entry(table, &idx.field, &k, loc)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Constraint enforcement
// ---------------------------------------------------------------------

fn validate_not_null_pk(constraints: &ConstraintCatalogue, table: &str, doc: &Document) -> Result<()> {
    if let Some(pk) = constraints.primary_key(table) {
        for col in &pk.columns {
            match doc.get_path(col) {
                Some(v) if !matches!(v, FieldValue::Null) => {}
                _ => return Err(Error::NotNullViolation(format!("{table}.{col}"))),
            }
        }
    }
    Ok(())
}

fn find_unique_conflict(ctx: &ExecCtx, table: &str, columns: &[String], excluding: Option<u64>, doc: &Document) -> Result<Option<RecordLocation>> {
    let values: Vec<Option<FieldValue>> = columns.iter().map(|c| doc.get_path(c).cloned()).collect();
    if values.iter().any(|v| matches!(v, None | Some(FieldValue::Null))) {
        return Ok(None);
    }
    if columns.len() == 1 {
        if let Some(key) = encode_sortable_key(values[0].as_ref().unwrap()) {
            if ctx.pager.find_index(table, &columns[0]).is_some() {
                for loc in ctx.pager.index_lookup(table, &columns[0], &key)? {
                    if Some(loc.record_id) == excluding {
                        continue;
                    }
                    return Ok(Some(loc));
                }
                return Ok(None);
            }
        }
    }
    for (loc, bytes) in ctx.pager.scan_collection(table)? {
        if Some(loc.record_id) == excluding {
            continue;
        }
        let Ok(other) = Document::decode(&bytes) else { continue };
        let matches = columns.iter().zip(&values).all(|(c, v)| other.get_path(c) == v.as_ref());
        if matches {
            return Ok(Some(loc));
        }
    }
    Ok(None)
}

fn check_uniques(ctx: &ExecCtx, table: &str, doc: &Document, excluding: Option<u64>) -> Result<()> {
    for c in ctx.constraints.unique_constraints(table).cloned().collect::<Vec<_>>() {
        if find_unique_conflict(ctx, table, &c.columns, excluding, doc)?.is_some() {
            return Err(Error::DuplicateKey(format!("{table}.{}", c.columns.join(","))));
        }
    }
    Ok(())
}

fn find_children(ctx: &ExecCtx, table: &str, col: &str, value: &FieldValue) -> Result<Vec<(RecordLocation, Document)>> {
    if let Some(key) = encode_sortable_key(value) {
        if ctx.pager.find_index(table, col).is_some() {
            let mut out = Vec::new();
            for loc in ctx.pager.index_lookup(table, col, &key)? {
                if let Ok(bytes) = ctx.pager.read_record(loc) {
                    if let Ok(d) = Document::decode(&bytes) {
                        out.push((loc, d));
                    }
                }
            }
            return Ok(out);
        }
    }
    let mut out = Vec::new();
    for (loc, bytes) in ctx.pager.scan_collection(table)? {
        if let Ok(d) = Document::decode(&bytes) {
            if d.get_path(col) == Some(value) {
                out.push((loc, d));
            }
        }
    }
    Ok(out)
}

fn check_foreign_keys(ctx: &ExecCtx, table: &str, doc: &Document) -> Result<()> {
    for fk in ctx.constraints.foreign_keys_on(table).cloned().collect::<Vec<_>>() {
        let Some(col) = fk.columns.first() else { continue };
        let Some(val) = doc.get_path(col) else { continue };
        if matches!(val, FieldValue::Null) {
            continue;
        }
        let ref_table = fk.ref_table.clone().unwrap_or_default();
        let ref_col = fk.ref_column.clone().unwrap_or_default();
        if find_children(ctx, &ref_table, &ref_col, val)?.is_empty() {
            return Err(Error::ForeignKeyViolation(format!("{table}.{col} -> {ref_table}.{ref_col}")));
        }
    }
    Ok(())
}

fn enforce_delete_cascade(ctx: &mut ExecCtx, table: &str, doc: &Document, visited: &mut Vec<(String, u64)>) -> Result<()> {
    for fk in ctx.constraints.foreign_keys_referencing(table).cloned().collect::<Vec<_>>() {
        let ref_col = fk.ref_column.clone().unwrap_or_default();
        let Some(ref_val) = doc.get_path(&ref_col).cloned() else { continue };
        if matches!(ref_val, FieldValue::Null) {
            continue;
        }
        let Some(child_col) = fk.columns.first().cloned() else { continue };
        let children = find_children(ctx, &fk.table, &child_col, &ref_val)?;
        if children.is_empty() {
            continue;
        }
        match fk.on_delete.unwrap_or(OnDelete::Restrict) {
            OnDelete::Restrict | OnDelete::NoAction => {
                return Err(Error::ForeignKeyViolation(format!("{}.{} references {table}", fk.table, child_col)));
            }
            OnDelete::Cascade => {
                for (loc, cdoc) in children {
                    let key = (fk.table.clone(), loc.record_id);
                    if visited.contains(&key) {
                        continue;
                    }
                    visited.push(key);
                    enforce_delete_cascade(ctx, &fk.table, &cdoc, visited)?;
                    ctx.pager.mark_deleted(loc)?;
                    index_remove_for_doc(ctx, &fk.table, &cdoc, loc.record_id)?;
                    ctx.pager.end_statement()?;
                }
            }
            OnDelete::SetNull => {
                for (loc, cdoc) in children {
                    let mut updated = cdoc.clone();
                    updated.set(&child_col, FieldValue::Null);
                    let new_bytes = updated.encode();
                    let new_loc = ctx.pager.update_record(&fk.table, loc, &new_bytes)?;
                    sync_indexes_on_update(ctx, &fk.table, &cdoc, &updated, new_loc)?;
                    ctx.pager.end_statement()?;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// DML
// ---------------------------------------------------------------------

fn stamp_id(doc: &mut Document, record_id: u64) {
    if doc.get("_id").is_none() && doc.get("id").is_none() {
        doc.set("_id", FieldValue::Int64(record_id as i64));
    }
}

fn values_row_to_document(fields: &[(String, Expr)], ctx: &mut ExecCtx) -> Result<Document> {
    let empty = RowCtx::new(Vec::new());
    let mut doc = Document::new();
    for (name, expr) in fields {
        let v = eval(expr, &empty, ctx)?;
        doc.push(name.clone(), v.to_field_value());
    }
    Ok(doc)
}

pub fn execute_insert(ctx: &mut ExecCtx, insert: &Insert) -> Result<Outcome> {
    let table = &insert.table;
    let incoming: Vec<Document> = match &insert.source {
        InsertSource::Values(rows) => {
            let mut docs = Vec::with_capacity(rows.len());
            for row in rows {
                docs.push(values_row_to_document(row, ctx)?);
            }
            docs
        }
        InsertSource::Select(select) => run_select(ctx, select, None)?.0,
    };

    let mut rows_affected = 0u64;
    let mut last_insert_id = 0u64;

    for doc in incoming {
        validate_not_null_pk(ctx.constraints, table, &doc)?;
        check_foreign_keys(ctx, table, &doc)?;

        if insert.or_replace {
            let pk_cols: Vec<String> = ctx.constraints.primary_key(table).map(|c| c.columns.clone()).unwrap_or_default();
            let conflict = if pk_cols.is_empty() { None } else { find_unique_conflict(ctx, table, &pk_cols, None, &doc)? };
            if let Some(loc) = conflict {
                let mut new_doc = doc.clone();
                stamp_id(&mut new_doc, loc.record_id);
                let old_bytes = ctx.pager.read_record(loc)?;
                let old_doc = Document::decode(&old_bytes).unwrap_or_default();
                let new_bytes = new_doc.encode();
                let new_loc = ctx.pager.update_record(table, loc, &new_bytes)?;
                sync_indexes_on_update(ctx, table, &old_doc, &new_doc, new_loc)?;
                ctx.pager.end_statement()?;
                rows_affected += 1;
                last_insert_id = loc.record_id;
                continue;
            }
        } else {
            check_uniques(ctx, table, &doc, None)?;
        }

        let record_id = ctx.pager.peek_next_record_id(table);
        let locks = ctx.pager.lock_manager_arc();
        let guard = locks.acquire(ctx.pager.collection_lock_id(table), record_id)?;
        let mut new_doc = doc.clone();
        stamp_id(&mut new_doc, record_id);
        let bytes = new_doc.encode();
        let loc = ctx.pager.insert_record(table, &bytes)?;
        drop(guard);
        index_insert_for_doc(ctx, table, &new_doc, loc)?;
        ctx.pager.end_statement()?;
        rows_affected += 1;
        last_insert_id = loc.record_id;
    }

    Ok(Outcome { docs: vec![], rows_affected, last_insert_id })
}

pub fn execute_update(ctx: &mut ExecCtx, update: &Update) -> Result<Outcome> {
    let table = &update.table;
    let no_cache = update.hints.contains(&HintItem::NoCache);
    let rows = if no_cache { ctx.pager.scan_collection_uncached(table)? } else { ctx.pager.scan_collection(table)? };
    let mut affected = 0u64;

    for (loc, bytes) in rows {
        let Ok(doc) = Document::decode(&bytes) else { continue };
        let row = Row::single(table, doc.clone());
        let matched = match &update.filter {
            Some(f) => eval(f, &row_ctx(&row, None), ctx)?.truthy(),
            None => true,
        };
        if !matched {
            continue;
        }

        let locks = ctx.pager.lock_manager_arc();
        let guard = locks.acquire(ctx.pager.collection_lock_id(table), loc.record_id)?;
        let rc = row_ctx(&row, None);
        let mut new_doc = doc.clone();
        for (field, expr) in &update.assignments {
            let v = eval(expr, &rc, ctx)?;
            new_doc.set(field, v.to_field_value());
        }
        drop(rc);

        validate_not_null_pk(ctx.constraints, table, &new_doc)?;
        check_foreign_keys(ctx, table, &new_doc)?;
        check_uniques(ctx, table, &new_doc, Some(loc.record_id))?;

        let new_bytes = new_doc.encode();
        let new_loc = ctx.pager.update_record(table, loc, &new_bytes)?;
        drop(guard);
        sync_indexes_on_update(ctx, table, &doc, &new_doc, new_loc)?;
        ctx.pager.end_statement()?;
        affected += 1;
    }

    Ok(Outcome { docs: vec![], rows_affected: affected, last_insert_id: 0 })
}

pub fn execute_delete(ctx: &mut ExecCtx, delete: &Delete) -> Result<Outcome> {
    let table = &delete.table;
    let no_cache = delete.hints.contains(&HintItem::NoCache);
    let rows = if no_cache { ctx.pager.scan_collection_uncached(table)? } else { ctx.pager.scan_collection(table)? };
    let mut affected = 0u64;

    for (loc, bytes) in rows {
        let Ok(doc) = Document::decode(&bytes) else { continue };
        let row = Row::single(table, doc.clone());
        let matched = match &delete.filter {
            Some(f) => eval(f, &row_ctx(&row, None), ctx)?.truthy(),
            None => true,
        };
        if !matched {
            continue;
        }

        let locks = ctx.pager.lock_manager_arc();
        let guard = locks.acquire(ctx.pager.collection_lock_id(table), loc.record_id)?;
        let mut visited = Vec::new();
        enforce_delete_cascade(ctx, table, &doc, &mut visited)?;
        ctx.pager.mark_deleted(loc)?;
        drop(guard);
        index_remove_for_doc(ctx, table, &doc, loc.record_id)?;
        ctx.pager.end_statement()?;
        affected += 1;
    }

    Ok(Outcome { docs: vec![], rows_affected: affected, last_insert_id: 0 })
}

pub fn execute_truncate(ctx: &mut ExecCtx, table: &str) -> Result<Outcome> {
    for (loc, bytes) in ctx.pager.scan_collection(table)? {
        if let Ok(doc) = Document::decode(&bytes) {
            index_remove_for_doc(ctx, table, &doc, loc.record_id)?;
        }
    }
    let count = ctx.pager.truncate_collection(table)?;
    ctx.pager.end_statement()?;
    Ok(Outcome { docs: vec![], rows_affected: count, last_insert_id: 0 })
}

// ---------------------------------------------------------------------
// DDL: ALTER TABLE, ANALYZE
// ---------------------------------------------------------------------

pub fn execute_alter_table(ctx: &mut ExecCtx, table: &str, constraint: &ConstraintDef) -> Result<Outcome> {
    let c = match constraint {
        ConstraintDef::PrimaryKey { name, columns } => Constraint {
            name: name.clone().unwrap_or_else(|| format!("{table}_pk")),
            kind: ConstraintKind::PrimaryKey,
            table: table.to_string(),
            columns: columns.clone(),
            ref_table: None,
            ref_column: None,
            on_delete: None,
        },
        ConstraintDef::Unique { name, columns } => Constraint {
            name: name.clone().unwrap_or_else(|| format!("{table}_unique_{}", columns.join("_"))),
            kind: ConstraintKind::Unique,
            table: table.to_string(),
            columns: columns.clone(),
            ref_table: None,
            ref_column: None,
            on_delete: None,
        },
        ConstraintDef::ForeignKey { name, columns, ref_table, ref_columns, on_delete } => Constraint {
            name: name.clone().unwrap_or_else(|| format!("{table}_fk_{}", columns.join("_"))),
            kind: ConstraintKind::ForeignKey,
            table: table.to_string(),
            columns: columns.clone(),
            ref_table: Some(ref_table.clone()),
            ref_column: ref_columns.first().cloned(),
            on_delete: Some(*on_delete),
        },
    };

    // Validate against existing data before persisting the constraint.
    for (_, bytes) in ctx.pager.scan_collection(table)? {
        let Ok(doc) = Document::decode(&bytes) else { continue };
        match c.kind {
            ConstraintKind::PrimaryKey => {
                for col in &c.columns {
                    if matches!(doc.get_path(col), None | Some(FieldValue::Null)) {
                        return Err(Error::NotNullViolation(format!("{table}.{col}")));
                    }
                }
            }
            ConstraintKind::ForeignKey => {
                let Some(col) = c.columns.first() else { continue };
                if let Some(v) = doc.get_path(col) {
                    if !matches!(v, FieldValue::Null) {
                        let ref_table = c.ref_table.clone().unwrap_or_default();
                        let ref_col = c.ref_column.clone().unwrap_or_default();
                        if find_children(ctx, &ref_table, &ref_col, v)?.is_empty() {
                            return Err(Error::ForeignKeyViolation(format!("{table}.{col} -> {ref_table}.{ref_col}")));
                        }
                    }
                }
            }
            ConstraintKind::Unique => {}
        }
    }
    if matches!(c.kind, ConstraintKind::Unique | ConstraintKind::PrimaryKey) {
        for (loc, bytes) in ctx.pager.scan_collection(table)? {
            let Ok(doc) = Document::decode(&bytes) else { continue };
            if find_unique_conflict(ctx, table, &c.columns, Some(loc.record_id), &doc)?.is_some() {
                return Err(Error::DuplicateKey(format!("{table}.{}", c.columns.join(","))));
            }
        }
    }

    ctx.constraints.add(ctx.pager, c)?;
    Ok(Outcome { docs: vec![], rows_affected: 0, last_insert_id: 0 })
}

fn column_values(docs: &[Document], field: &str) -> Vec<FieldValue> {
    docs.iter().filter_map(|d| d.get_path(field).cloned()).filter(|v| !matches!(v, FieldValue::Null)).collect()
}

fn numeric_of(v: &FieldValue) -> Option<f64> {
    match v {
        FieldValue::Int64(i) => Some(*i as f64),
        FieldValue::Float64(f) => Some(*f),
        FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn bound_of(v: &FieldValue) -> Option<Bound> {
    match v {
        FieldValue::String(s) => Some(Bound::Text(s.clone())),
        other => numeric_of(other).map(Bound::Numeric),
    }
}

fn compare_bounds(a: &Bound, b: &Bound) -> std::cmp::Ordering {
    match (a, b) {
        (Bound::Numeric(x), Bound::Numeric(y)) => x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
        (Bound::Text(x), Bound::Text(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    }
}

fn build_column_stats(field: &str, docs: &[Document], row_count: u64) -> ColumnStats {
    let present = column_values(docs, field);
    let null_count = row_count.saturating_sub(present.len() as u64);
    let mut distinct: Vec<FieldValue> = Vec::new();
    for v in &present {
        if !distinct.contains(v) {
            distinct.push(v.clone());
        }
    }

    let numeric: Vec<f64> = present.iter().filter_map(numeric_of).collect();
    let strings: Vec<&String> = present.iter().filter_map(|v| if let FieldValue::String(s) = v { Some(s) } else { None }).collect();

    let min = present.iter().filter_map(bound_of).min_by(compare_bounds);
    let max = present.iter().filter_map(bound_of).max_by(compare_bounds);
    let mean_string_length =
        if strings.is_empty() { None } else { Some(strings.iter().map(|s| s.chars().count() as f64).sum::<f64>() / strings.len() as f64) };

    let histogram = if numeric.len() < 2 {
        Vec::new()
    } else {
        let mut sorted = numeric.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let lo = sorted[0];
        let hi = *sorted.last().unwrap();
        if hi <= lo {
            Vec::new()
        } else {
            let buckets = DEFAULT_HISTOGRAM_BUCKETS;
            let width = (hi - lo) / buckets as f64;
            let mut hist = Vec::with_capacity(buckets);
            for i in 0..buckets {
                let lower = lo + width * i as f64;
                let upper = if i == buckets - 1 { hi } else { lo + width * (i + 1) as f64 };
                let in_bucket: Vec<f64> = sorted.iter().copied().filter(|v| *v >= lower && (*v < upper || (i == buckets - 1 && *v <= upper))).collect();
                let mut ndv_vals: Vec<f64> = Vec::new();
                for v in &in_bucket {
                    if !ndv_vals.contains(v) {
                        ndv_vals.push(*v);
                    }
                }
                hist.push(HistogramBucket {
                    lower: ordered_float::OrderedFloat(lower),
                    upper: ordered_float::OrderedFloat(upper),
                    count: in_bucket.len() as u64,
                    ndv: ndv_vals.len() as u64,
                });
            }
            hist
        }
    };

    ColumnStats {
        field: field.to_string(),
        count_present: present.len() as u64,
        null_count,
        ndv: distinct.len() as u64,
        min,
        max,
        mean_string_length,
        histogram,
    }
}

fn build_table_stats(pager: &Pager, table: &str) -> Result<TableStats> {
    let rows = pager.scan_collection(table)?;
    let row_count = rows.len() as u64;
    let docs: Vec<Document> = rows.into_iter().filter_map(|(_, bytes)| Document::decode(&bytes).ok()).collect();

    let mut field_names: Vec<String> = Vec::new();
    for d in &docs {
        for (k, _) in d.fields() {
            if !field_names.iter().any(|f| f == k) {
                field_names.push(k.to_string());
            }
        }
    }
    let columns = field_names.iter().map(|f| build_column_stats(f, &docs, row_count)).collect();
    let page_count = pager.total_pages().max(1) as u64;

    Ok(TableStats { table: table.to_string(), row_count, page_count, analyzed_at: chrono::Utc::now().timestamp(), columns })
}

pub fn execute_analyze(ctx: &mut ExecCtx, table: Option<&str>) -> Result<Outcome> {
    let targets: Vec<String> = match table {
        Some(t) => vec![t.to_string()],
        None => ctx.pager.collections().iter().map(|c: &CollectionMeta| c.name.clone()).filter(|n| !n.starts_with('_')).collect(),
    };
    for t in &targets {
        let stats = build_table_stats(ctx.pager, t)?;
        ctx.stats.put(ctx.pager, stats)?;
    }
    Ok(Outcome { docs: vec![], rows_affected: targets.len() as u64, last_insert_id: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ConstraintDef, Join, JoinKind, OnDelete};
    use crate::query_api::Database;
    use tempfile::tempdir;

    fn insert(table: &str, fields: &[(&str, Expr)]) -> crate::ast::Statement {
        crate::ast::Statement::Insert(Insert {
            table: table.to_string(),
            source: InsertSource::Values(vec![fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()]),
            or_replace: false,
        })
    }

    #[test]
    fn foreign_key_cascade_delete_removes_children() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();

        db.execute(&insert("authors", &[("_id", Expr::Literal(Literal::Int64(1)))])).unwrap();
        db.execute(&insert("books", &[("author_id", Expr::Literal(Literal::Int64(1)))])).unwrap();
        db.execute(&insert("books", &[("author_id", Expr::Literal(Literal::Int64(1)))])).unwrap();

        db.execute(&crate::ast::Statement::AlterTable {
            table: "books".to_string(),
            constraint: ConstraintDef::ForeignKey {
                name: None,
                columns: vec!["author_id".to_string()],
                ref_table: "authors".to_string(),
                ref_columns: vec!["_id".to_string()],
                on_delete: OnDelete::Cascade,
            },
        })
        .unwrap();

        db.execute(&crate::ast::Statement::Delete(Delete {
            table: "authors".to_string(),
            filter: Some(Expr::Binary {
                op: BinaryOp::Eq,
                left: Box::new(Expr::Path { qualifier: None, path: "_id".to_string() }),
                right: Box::new(Expr::Literal(Literal::Int64(1))),
            }),
            hints: vec![],
        }))
        .unwrap();

        let remaining_books = db
            .execute(&crate::ast::Statement::Select(Select {
                columns: vec![SelectItem::Wildcard { qualifier: None }],
                from: "books".to_string(),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(remaining_books.docs.len(), 0);
    }

    #[test]
    fn join_result_is_identical_regardless_of_strategy_hint() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("db.ndb")).unwrap();

        for i in 0..3 {
            db.execute(&insert("a", &[("key", Expr::Literal(Literal::Int64(i)))])).unwrap();
            db.execute(&insert("b", &[("key", Expr::Literal(Literal::Int64(i))), ("val", Expr::Literal(Literal::Int64(i * 10)))])).unwrap();
        }

        let join_on = Expr::Binary {
            op: BinaryOp::Eq,
            left: Box::new(Expr::Path { qualifier: Some("a".to_string()), path: "key".to_string() }),
            right: Box::new(Expr::Path { qualifier: Some("b".to_string()), path: "key".to_string() }),
        };

        let base = Select {
            columns: vec![SelectItem::Wildcard { qualifier: None }],
            from: "a".to_string(),
            joins: vec![Join { kind: JoinKind::Inner, table: "b".to_string(), alias: None, on: join_on.clone() }],
            ..Default::default()
        };

        let mut nested_loop = base.clone();
        nested_loop.hints = vec![HintItem::NestedLoop];
        let mut hash = base.clone();
        hash.hints = vec![HintItem::HashJoin];

        let nested_loop_rows = db.execute(&crate::ast::Statement::Select(nested_loop)).unwrap().docs;
        let hash_rows = db.execute(&crate::ast::Statement::Select(hash)).unwrap().docs;

        assert_eq!(nested_loop_rows.len(), 3);
        assert_eq!(nested_loop_rows.len(), hash_rows.len());
        for row in &nested_loop_rows {
            assert!(hash_rows.contains(row));
        }
    }
}
