//! Cost model and optimizer: scan strategy selection, join strategy
//! selection, and selectivity/cardinality estimation. Consumes `TableStats`
//! gathered by `ANALYZE` when available and falls back to fixed defaults
//! otherwise, exactly per the distilled cost formulas.

use novusdb_storage::stats::{Bound, ColumnStats, TableStats};

use crate::ast::{BinaryOp, Expr, HintItem, JoinKind, Literal};

#[derive(Debug, Clone, PartialEq)]
pub enum ScanStrategy {
    FullScan,
    IndexLookup { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    NestedLoop,
    HashJoin,
    IndexLookupJoin,
}

impl JoinStrategy {
    pub fn cost_formula(&self) -> &'static str {
        match self {
            JoinStrategy::HashJoin => "O(n+m)",
            JoinStrategy::IndexLookupJoin => "n * log m",
            JoinStrategy::NestedLoop => "n * m",
        }
    }
}

/// `distinct_pages(n, P) = ceil(P * (1 - (1 - 1/P)^n))`, clamped to `[1, P]`.
pub fn distinct_pages(n: u64, pages: u64) -> u64 {
    if pages == 0 {
        return 0;
    }
    if n == 0 {
        return 0;
    }
    let p = pages as f64;
    let estimate = p * (1.0 - (1.0 - 1.0 / p).powf(n as f64));
    (estimate.ceil() as u64).clamp(1, pages)
}

/// Whether an index lookup beats a full scan, per §4.8's rule ladder.
pub fn should_use_index(candidate_count: Option<u64>, row_count: u64, page_count: u64) -> bool {
    let Some(candidates) = candidate_count else {
        return false;
    };
    if page_count <= 2 {
        return true;
    }
    if row_count > 0 && (candidates as f64) <= 0.30 * row_count as f64 {
        return true;
    }
    let full_cost = page_count as f64 * 1.0 + row_count as f64 * 0.01;
    let index_cost = distinct_pages(candidates, page_count) as f64 * 4.0 + candidates as f64 * 0.01;
    index_cost < full_cost
}

/// Join strategy for an equi-join `left.a = right.b`, honoring hints first.
pub fn choose_join_strategy(hints: &[HintItem], is_equi_join: bool, right_has_index: bool) -> JoinStrategy {
    if hints.contains(&HintItem::HashJoin) {
        return JoinStrategy::HashJoin;
    }
    if hints.contains(&HintItem::NestedLoop) {
        return JoinStrategy::NestedLoop;
    }
    if !is_equi_join {
        return JoinStrategy::NestedLoop;
    }
    if right_has_index {
        JoinStrategy::IndexLookupJoin
    } else {
        JoinStrategy::HashJoin
    }
}

pub fn join_kind_is_outer(kind: JoinKind) -> bool {
    matches!(kind, JoinKind::Left | JoinKind::Right)
}

/// `ceil(|L|*|R| / max(NDV_L, NDV_R))`, clamped to at least 1. Exact row
/// counts are used instead when either join column is known unique.
pub fn join_cardinality(left_rows: u64, right_rows: u64, left_ndv: u64, right_ndv: u64) -> u64 {
    let denom = left_ndv.max(right_ndv).max(1);
    (((left_rows as f64) * (right_rows as f64) / denom as f64).ceil() as u64).max(1)
}

/// Extracts `(qualifier, path, literal, op)` from a simple `column OP
/// literal` comparison, normalizing `literal OP column` to the same shape
/// with a flipped operator.
fn as_column_literal(expr: &Expr) -> Option<(Option<&str>, &str, &Literal, BinaryOp)> {
    if let Expr::Binary { op, left, right } = expr {
        if let (Expr::Path { qualifier, path }, Expr::Literal(lit)) = (left.as_ref(), right.as_ref()) {
            return Some((qualifier.as_deref(), path.as_str(), lit, *op));
        }
        if let (Expr::Literal(lit), Expr::Path { qualifier, path }) = (left.as_ref(), right.as_ref()) {
            return Some((qualifier.as_deref(), path.as_str(), lit, flip(*op)));
        }
    }
    None
}

fn flip(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::LtEq => BinaryOp::GtEq,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::GtEq => BinaryOp::LtEq,
        other => other,
    }
}

fn literal_f64(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Int64(i) => Some(*i as f64),
        Literal::Float64(f) => Some(*f),
        Literal::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Selectivity of an equality/range predicate against a column's histogram,
/// falling back to the column-less defaults when `stats` is absent.
pub fn estimate_selectivity(expr: &Expr, stats: Option<&TableStats>, pk_unique_columns: &[String]) -> f64 {
    match expr {
        Expr::And(l, r) => {
            estimate_selectivity(l, stats, pk_unique_columns) * estimate_selectivity(r, stats, pk_unique_columns)
        }
        Expr::Or(l, r) => {
            let p = estimate_selectivity(l, stats, pk_unique_columns);
            let q = estimate_selectivity(r, stats, pk_unique_columns);
            p + q - p * q
        }
        Expr::Not(inner) => 1.0 - estimate_selectivity(inner, stats, pk_unique_columns),
        Expr::Between { expr, low, high, negated } => {
            let base = 'estimate: {
                let Expr::Path { path, .. } = expr.as_ref() else { break 'estimate 0.25 };
                let Some(col) = stats.and_then(|s| s.column(path)) else { break 'estimate 0.25 };
                let (Some(Bound::Numeric(min)), Some(Bound::Numeric(max))) = (&col.min, &col.max) else { break 'estimate 0.25 };
                if *max <= *min {
                    break 'estimate 0.25;
                }
                let (Expr::Literal(low_lit), Expr::Literal(high_lit)) = (low.as_ref(), high.as_ref()) else { break 'estimate 0.25 };
                let (Some(lo), Some(hi)) = (literal_f64(low_lit), literal_f64(high_lit)) else { break 'estimate 0.25 };
                ((hi - lo) / (max - min)).clamp(0.0, 1.0)
            };
            if *negated { 1.0 - base } else { base }
        }
        Expr::In { expr, list, .. } => {
            let k = list.len().max(1) as f64;
            if let Expr::Path { path, .. } = expr.as_ref() {
                if let Some(col) = stats.and_then(|s| s.column(path)) {
                    return (k / col.ndv.max(1) as f64).min(1.0);
                }
            }
            (0.1 * k).min(0.9)
        }
        Expr::IsNull { expr, negated } => {
            let base = if let Expr::Path { path, .. } = expr.as_ref() {
                if let Some(col) = stats.and_then(|s| s.column(path)) {
                    if let Some(s) = stats {
                        if s.row_count > 0 {
                            col.null_count as f64 / s.row_count as f64
                        } else {
                            0.05
                        }
                    } else {
                        0.05
                    }
                } else {
                    0.05
                }
            } else {
                0.05
            };
            if *negated { 1.0 - base } else { base }
        }
        Expr::Like { negated, .. } => {
            if *negated { 0.9 } else { 0.25 }
        }
        _ => {
            if let Some((_, path, lit, op)) = as_column_literal(expr) {
                let column_stats = stats.and_then(|s| s.column(path));
                match op {
                    BinaryOp::Eq => {
                        if pk_unique_columns.iter().any(|c| c == path) {
                            if let Some(s) = stats {
                                return 1.0 / s.row_count.max(1) as f64;
                            }
                        }
                        match column_stats {
                            Some(col) => 1.0 / col.ndv.max(1) as f64,
                            None => 0.1,
                        }
                    }
                    BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                        match (column_stats, literal_f64(lit)) {
                            (Some(col), Some(value)) if !col.histogram.is_empty() => {
                                histogram_range_selectivity(col, value, op)
                            }
                            _ => 0.33,
                        }
                    }
                    _ => 0.1,
                }
            } else {
                0.1
            }
        }
    }
}

/// Walks the histogram buckets accumulating the fraction of rows that
/// satisfy `column OP value`, linearly interpolating within the bucket the
/// literal falls inside.
fn histogram_range_selectivity(col: &ColumnStats, value: f64, op: BinaryOp) -> f64 {
    let total: u64 = col.histogram.iter().map(|b| b.count).sum();
    if total == 0 {
        return 0.33;
    }
    let mut matched = 0.0f64;
    for bucket in &col.histogram {
        let (lower, upper) = (bucket.lower.into_inner(), bucket.upper.into_inner());
        let width = (upper - lower).max(f64::EPSILON);
        let frac_below = ((value - lower) / width).clamp(0.0, 1.0);
        let (above_count, below_count) = match op {
            BinaryOp::Gt | BinaryOp::GtEq => ((1.0 - frac_below) * bucket.count as f64, 0.0),
            BinaryOp::Lt | BinaryOp::LtEq => (0.0, frac_below * bucket.count as f64),
            _ => (0.0, 0.0),
        };
        matched += above_count + below_count;
    }
    (matched / total as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_pages_is_clamped_to_total_pages() {
        assert_eq!(distinct_pages(1000, 4), 4);
        assert_eq!(distinct_pages(0, 10), 0);
    }

    #[test]
    fn small_table_always_uses_index() {
        assert!(should_use_index(Some(1), 100, 2));
    }

    #[test]
    fn no_candidates_forces_full_scan() {
        assert!(!should_use_index(None, 1000, 50));
    }

    #[test]
    fn hint_overrides_join_strategy() {
        assert_eq!(
            choose_join_strategy(&[HintItem::NestedLoop], true, true),
            JoinStrategy::NestedLoop
        );
    }

    #[test]
    fn non_equi_join_always_nested_loop() {
        assert_eq!(choose_join_strategy(&[], false, true), JoinStrategy::NestedLoop);
    }

    #[test]
    fn join_cardinality_uses_max_ndv() {
        assert_eq!(join_cardinality(100, 10, 50, 5), 10);
    }

    #[test]
    fn between_selectivity_uses_column_range_when_stats_are_present() {
        let stats = TableStats {
            table: "items".to_string(),
            row_count: 100,
            page_count: 4,
            analyzed_at: 0,
            columns: vec![ColumnStats {
                field: "price".to_string(),
                count_present: 100,
                null_count: 0,
                ndv: 100,
                min: Some(Bound::Numeric(0.0)),
                max: Some(Bound::Numeric(100.0)),
                mean_string_length: None,
                histogram: Vec::new(),
            }],
        };
        let expr = Expr::Between {
            expr: Box::new(Expr::Path { qualifier: None, path: "price".to_string() }),
            low: Box::new(Expr::Literal(Literal::Int64(20))),
            high: Box::new(Expr::Literal(Literal::Int64(40))),
            negated: false,
        };
        assert!((estimate_selectivity(&expr, Some(&stats), &[]) - 0.2).abs() < 1e-9);

        let negated = Expr::Between {
            expr: Box::new(Expr::Path { qualifier: None, path: "price".to_string() }),
            low: Box::new(Expr::Literal(Literal::Int64(20))),
            high: Box::new(Expr::Literal(Literal::Int64(40))),
            negated: true,
        };
        assert!((estimate_selectivity(&negated, Some(&stats), &[]) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn between_selectivity_falls_back_without_stats() {
        let expr = Expr::Between {
            expr: Box::new(Expr::Path { qualifier: None, path: "price".to_string() }),
            low: Box::new(Expr::Literal(Literal::Int64(20))),
            high: Box::new(Expr::Literal(Literal::Int64(40))),
            negated: false,
        };
        assert_eq!(estimate_selectivity(&expr, None, &[]), 0.25);
    }
}
