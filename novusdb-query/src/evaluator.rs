//! Expression evaluation: three-valued-ish scalar `Value`s, wildcard path
//! resolution over `Document`, and the scalar function library. Aggregate
//! recognition lives here (`aggregate_name`); actual grouping/accumulation is
//! the executor's job since it spans many rows.

use std::fmt;

use chrono::Utc;
use novusdb_storage::{Document, FieldValue};

use crate::ast::{BinaryOp, ClockFn, Expr, Literal, Select, SequenceOp};
use crate::error::{Error, Result};

/// A scalar evaluation result, or `Multi` — the existentially-quantified
/// bag of scalars produced by a wildcard path (`a.*`, `a.**`). Predicate
/// operators quantify existentially over `Multi`; projections fall back to
/// the first match (or null) since a row has one slot per column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Multi(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(i) => write!(f, "{i}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Multi(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl Value {
    pub fn from_field_value(v: &FieldValue) -> Self {
        match v {
            FieldValue::Null => Value::Null,
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Int64(i) => Value::Int64(*i),
            FieldValue::Float64(f) => Value::Float64(*f),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Document(_) | FieldValue::Array(_) => Value::Null,
        }
    }

    pub fn to_field_value(&self) -> FieldValue {
        match self {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Int64(i) => FieldValue::Int64(*i),
            Value::Float64(f) => FieldValue::Float64(*f),
            Value::String(s) => FieldValue::String(s.clone()),
            Value::Multi(items) => items.first().map(Value::to_field_value).unwrap_or(FieldValue::Null),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean coercion: `0`/`""`/`false`/`null` are false, everything else
    /// true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int64(i) => *i != 0,
            Value::Float64(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Multi(items) => items.iter().any(Value::truthy),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One table's live row binding during expression evaluation: either its
/// alias or bare table name, and the document. `parent` chains to the
/// enclosing row context for a correlated subquery: a name not found among
/// `tables` falls back to the outer row rather than failing resolution.
pub struct RowCtx<'a> {
    pub tables: Vec<(&'a str, &'a Document)>,
    pub parent: Option<&'a RowCtx<'a>>,
}

impl<'a> RowCtx<'a> {
    pub fn single(name: &'a str, doc: &'a Document) -> Self {
        Self { tables: vec![(name, doc)], parent: None }
    }

    pub fn new(tables: Vec<(&'a str, &'a Document)>) -> Self {
        Self { tables, parent: None }
    }

    pub fn with_parent(tables: Vec<(&'a str, &'a Document)>, parent: &'a RowCtx<'a>) -> Self {
        Self { tables, parent: Some(parent) }
    }

    /// Resolves a possibly-qualified dotted path against this row context,
    /// returning every scalar match (usually exactly one, more for `*`/`**`).
    /// Falls back to the parent row context (correlated outer row) when this
    /// context has no binding under that qualifier/name.
    pub fn resolve(&self, qualifier: Option<&str>, path: &str) -> Vec<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let hits = match qualifier {
            Some(q) => self
                .tables
                .iter()
                .find(|(name, _)| *name == q)
                .map(|(_, doc)| resolve_in_document(doc, &segments))
                .unwrap_or_default(),
            None => {
                let mut found = Vec::new();
                for (_, doc) in &self.tables {
                    let hits = resolve_in_document(doc, &segments);
                    if !hits.is_empty() {
                        found = hits;
                        break;
                    }
                }
                found
            }
        };
        if hits.is_empty() {
            if let Some(parent) = self.parent {
                return parent.resolve(qualifier, path);
            }
        }
        hits
    }

    pub fn document_for(&self, qualifier: Option<&str>) -> Option<&'a Document> {
        match qualifier {
            Some(q) => self.tables.iter().find(|(name, _)| *name == q).map(|(_, d)| *d),
            None => self.tables.first().map(|(_, d)| *d),
        }
    }
}

fn resolve_in_document(doc: &Document, segments: &[&str]) -> Vec<Value> {
    collect(&FieldValue::Document(doc.clone()), segments)
}

fn collect(value: &FieldValue, segments: &[&str]) -> Vec<Value> {
    if segments.is_empty() {
        return match value {
            FieldValue::Document(_) | FieldValue::Array(_) => Vec::new(),
            other => vec![Value::from_field_value(other)],
        };
    }

    let seg = segments[0];
    let rest = &segments[1..];

    if seg == "**" {
        let mut out = collect(value, rest);
        if let FieldValue::Document(d) = value {
            for (_, child) in d.fields() {
                out.extend(collect(child, segments));
            }
        }
        out
    } else if seg == "*" {
        match value {
            FieldValue::Document(d) => d.fields().flat_map(|(_, child)| collect(child, rest)).collect(),
            _ => Vec::new(),
        }
    } else {
        match value {
            FieldValue::Document(d) => d.get(seg).map(|child| collect(child, rest)).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Collaborators the evaluator defers to for things outside pure expression
/// evaluation: sequence state, bind parameters and correlated subqueries.
/// Implemented by the executor, which alone has Pager access.
pub trait EvalEnv {
    fn parameter(&self, name: &str) -> Result<Value>;
    fn sequence_nextval(&mut self, name: &str) -> Result<i64>;
    fn sequence_currval(&self, name: &str) -> Result<i64>;
    fn eval_scalar_subquery(&mut self, select: &Select, outer: &RowCtx) -> Result<Value>;
    fn eval_in_subquery(&mut self, select: &Select, outer: &RowCtx) -> Result<Vec<Value>>;
}

const AGGREGATE_NAMES: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX"];

pub fn is_aggregate_call(name: &str) -> bool {
    AGGREGATE_NAMES.contains(&name.to_ascii_uppercase().as_str())
}

pub fn eval(expr: &Expr, row: &RowCtx, env: &mut dyn EvalEnv) -> Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(literal_value(lit)),
        Expr::Path { qualifier, path } => {
            let hits = row.resolve(qualifier.as_deref(), path);
            Ok(match hits.len() {
                0 => Value::Null,
                1 => hits.into_iter().next().unwrap(),
                _ => Value::Multi(hits),
            })
        }
        Expr::Binary { op, left, right } => {
            let l = eval(left, row, env)?;
            let r = eval(right, row, env)?;
            eval_binary(*op, &l, &r)
        }
        Expr::And(l, r) => {
            let lv = eval(l, row, env)?;
            if !lv.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(r, row, env)?.truthy()))
        }
        Expr::Or(l, r) => {
            let lv = eval(l, row, env)?;
            if lv.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(r, row, env)?.truthy()))
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, row, env)?.truthy())),
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, row, env)?;
            let is_null = quantify(&v, Value::is_null);
            Ok(Value::Bool(is_null != *negated))
        }
        Expr::Like { expr, pattern, negated } => {
            let v = eval(expr, row, env)?;
            let p = eval(pattern, row, env)?;
            let pattern_str = p.as_str().unwrap_or_default();
            let matched = quantify(&v, |x| like_match(x, pattern_str));
            Ok(Value::Bool(matched != *negated))
        }
        Expr::Between { expr, low, high, negated } => {
            let v = eval(expr, row, env)?;
            let lo = eval(low, row, env)?;
            let hi = eval(high, row, env)?;
            let matched = quantify(&v, |x| between(x, &lo, &hi));
            Ok(Value::Bool(matched != *negated))
        }
        Expr::In { expr, list, negated } => {
            let v = eval(expr, row, env)?;
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                values.push(eval(item, row, env)?);
            }
            let matched = quantify(&v, |x| values.iter().any(|candidate| values_equal(x, candidate)));
            Ok(Value::Bool(matched != *negated))
        }
        Expr::InSubquery { expr, subquery, negated } => {
            let v = eval(expr, row, env)?;
            let candidates = env.eval_in_subquery(subquery, row)?;
            let matched = quantify(&v, |x| candidates.iter().any(|c| values_equal(x, c)));
            Ok(Value::Bool(matched != *negated))
        }
        Expr::Call { name, args, distinct: _ } => eval_call(name, args, row, env),
        Expr::Case { operand, whens, else_branch } => {
            let operand_value = match operand {
                Some(e) => Some(eval(e, row, env)?),
                None => None,
            };
            for (cond, result) in whens {
                let matched = match &operand_value {
                    Some(ov) => values_equal(ov, &eval(cond, row, env)?),
                    None => eval(cond, row, env)?.truthy(),
                };
                if matched {
                    return eval(result, row, env);
                }
            }
            match else_branch {
                Some(e) => eval(e, row, env),
                None => Ok(Value::Null),
            }
        }
        Expr::Subquery(select) => env.eval_scalar_subquery(select, row),
        Expr::Sequence { name, op } => Ok(Value::Int64(match op {
            SequenceOp::NextVal => env.sequence_nextval(name)?,
            SequenceOp::CurrVal => env.sequence_currval(name)?,
        })),
        Expr::Clock(clock) => Ok(eval_clock(*clock)),
        Expr::Parameter(name) => env.parameter(name),
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::String(s) => Value::String(s.clone()),
        Literal::Int64(i) => Value::Int64(*i),
        Literal::Float64(f) => Value::Float64(*f),
        Literal::Bool(b) => Value::Bool(*b),
    }
}

fn eval_clock(clock: ClockFn) -> Value {
    let now = Utc::now();
    match clock {
        ClockFn::SysDate | ClockFn::CurrentTimestamp => Value::String(now.to_rfc3339()),
        ClockFn::CurrentDate => Value::String(now.format("%Y-%m-%d").to_string()),
    }
}

/// Applies `f` existentially over a `Multi` value's members, or directly to
/// a scalar. An empty `Multi` (no wildcard matches) is never a predicate
/// match.
fn quantify(v: &Value, f: impl Fn(&Value) -> bool) -> bool {
    match v {
        Value::Multi(items) => items.iter().any(f),
        other => f(other),
    }
}

/// Equality between null and null is true; null vs non-null is always
/// false; otherwise numeric coercion then string coercion, else false.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() && b.is_null() {
        return true;
    }
    if a.is_null() || b.is_null() {
        return false;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        _ => false,
    }
}

fn between(v: &Value, lo: &Value, hi: &Value) -> bool {
    if let (Some(x), Some(l), Some(h)) = (v.as_f64(), lo.as_f64(), hi.as_f64()) {
        return x >= l && x <= h;
    }
    if let (Value::String(x), Value::String(l), Value::String(h)) = (v, lo, hi) {
        return x.as_str() >= l.as_str() && x.as_str() <= h.as_str();
    }
    false
}

/// `%` matches any run of characters, `_` matches exactly one.
fn like_match(v: &Value, pattern: &str) -> bool {
    let text = match v {
        Value::String(s) => s.as_str(),
        _ => return false,
    };
    like_rec(text.as_bytes(), pattern.as_bytes())
}

fn like_rec(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'%') => like_rec(text, &pattern[1..]) || (!text.is_empty() && like_rec(&text[1..], pattern)),
        Some(b'_') => !text.is_empty() && like_rec(&text[1..], &pattern[1..]),
        Some(c) => !text.is_empty() && text[0] == *c && like_rec(&text[1..], &pattern[1..]),
    }
}

pub(crate) fn eval_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    use BinaryOp::*;
    match op {
        Add | Sub | Mul | Div | Mod => {
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Ok(Value::Null),
            };
            let both_int = matches!(l, Value::Int64(_)) && matches!(r, Value::Int64(_));
            match op {
                Add if both_int => Ok(Value::Int64(a as i64 + b as i64)),
                Sub if both_int => Ok(Value::Int64(a as i64 - b as i64)),
                Mul if both_int => Ok(Value::Int64(a as i64 * b as i64)),
                Mod if both_int => {
                    if b == 0.0 {
                        return Err(Error::DivisionByZero);
                    }
                    Ok(Value::Int64(a as i64 % b as i64))
                }
                Add => Ok(Value::Float64(a + b)),
                Sub => Ok(Value::Float64(a - b)),
                Mul => Ok(Value::Float64(a * b)),
                Div => {
                    if b == 0.0 {
                        return Err(Error::DivisionByZero);
                    }
                    Ok(Value::Float64(a / b))
                }
                Mod => {
                    if b == 0.0 {
                        return Err(Error::DivisionByZero);
                    }
                    Ok(Value::Float64(a % b))
                }
                _ => unreachable!(),
            }
        }
        Eq => Ok(Value::Bool(values_equal(l, r))),
        NotEq => Ok(Value::Bool(!values_equal(l, r))),
        Lt | LtEq | Gt | GtEq => Ok(Value::Bool(compare(l, r, op))),
    }
}

fn compare(l: &Value, r: &Value, op: BinaryOp) -> bool {
    let ord = if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        a.partial_cmp(&b)
    } else if let (Value::String(a), Value::String(b)) = (l, r) {
        Some(a.cmp(b))
    } else {
        None
    };
    let Some(ord) = ord else { return false };
    match op {
        BinaryOp::Lt => ord.is_lt(),
        BinaryOp::LtEq => ord.is_le(),
        BinaryOp::Gt => ord.is_gt(),
        BinaryOp::GtEq => ord.is_ge(),
        _ => false,
    }
}

fn eval_call(name: &str, args: &[Expr], row: &RowCtx, env: &mut dyn EvalEnv) -> Result<Value> {
    let mut values = Vec::with_capacity(args.len());
    for a in args {
        values.push(eval(a, row, env)?);
    }
    scalar_function(name, &values)
}

pub(crate) fn scalar_function(name: &str, args: &[Value]) -> Result<Value> {
    let upper = name.to_ascii_uppercase();
    let s = |i: usize| -> String {
        args.get(i).and_then(Value::as_str).map(str::to_string).unwrap_or_default()
    };
    let f = |i: usize| -> f64 { args.get(i).and_then(Value::as_f64).unwrap_or(0.0) };

    Ok(match upper.as_str() {
        "UPPER" => Value::String(s(0).to_uppercase()),
        "LOWER" => Value::String(s(0).to_lowercase()),
        "LENGTH" => Value::Int64(s(0).chars().count() as i64),
        "SUBSTR" => {
            let text = s(0);
            let start = f(1) as i64;
            let start_idx = if start > 0 { (start - 1) as usize } else { 0 };
            let chars: Vec<char> = text.chars().collect();
            let len = args.get(2).and_then(Value::as_f64).map(|v| v as usize).unwrap_or(chars.len());
            let end_idx = (start_idx + len).min(chars.len());
            if start_idx >= chars.len() {
                Value::String(String::new())
            } else {
                Value::String(chars[start_idx..end_idx].iter().collect())
            }
        }
        "CONCAT" => Value::String(args.iter().map(value_to_display).collect::<Vec<_>>().join("")),
        "REPLACE" => Value::String(s(0).replace(&s(1), &s(2))),
        "INSTR" => Value::Int64(s(0).find(&s(1)).map(|i| i as i64 + 1).unwrap_or(0)),
        "REVERSE" => Value::String(s(0).chars().rev().collect()),
        "REPEAT" => Value::String(s(0).repeat(f(1).max(0.0) as usize)),
        "HEX" => Value::String(s(0).bytes().map(|b| format!("{b:02X}")).collect()),
        "ABS" => Value::Float64(f(0).abs()),
        "ROUND" => {
            let places = args.get(1).and_then(Value::as_f64).unwrap_or(0.0) as i32;
            let factor = 10f64.powi(places);
            Value::Float64((f(0) * factor).round() / factor)
        }
        "CEIL" | "CEILING" => Value::Float64(f(0).ceil()),
        "FLOOR" => Value::Float64(f(0).floor()),
        "COALESCE" => args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
        "IFNULL" => {
            if args.first().map(Value::is_null).unwrap_or(true) {
                args.get(1).cloned().unwrap_or(Value::Null)
            } else {
                args[0].clone()
            }
        }
        "NULLIF" => {
            if args.len() >= 2 && values_equal(&args[0], &args[1]) {
                Value::Null
            } else {
                args.first().cloned().unwrap_or(Value::Null)
            }
        }
        "TYPEOF" => Value::String(
            match args.first() {
                Some(Value::Null) | None => "null",
                Some(Value::Bool(_)) => "bool",
                Some(Value::Int64(_)) => "int64",
                Some(Value::Float64(_)) => "float64",
                Some(Value::String(_)) => "string",
                Some(Value::Multi(_)) => "multi",
            }
            .to_string(),
        ),
        other => return Err(Error::InvalidArgument(format!("unknown scalar function {other}"))),
    })
}

fn value_to_display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEnv;
    impl EvalEnv for NoEnv {
        fn parameter(&self, _: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        fn sequence_nextval(&mut self, _: &str) -> Result<i64> {
            Ok(1)
        }
        fn sequence_currval(&self, _: &str) -> Result<i64> {
            Ok(1)
        }
        fn eval_scalar_subquery(&mut self, _: &Select, _: &RowCtx) -> Result<Value> {
            Ok(Value::Null)
        }
        fn eval_in_subquery(&mut self, _: &Select, _: &RowCtx) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn doc_with(pairs: &[(&str, FieldValue)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.push(*k, v.clone());
        }
        d
    }

    #[test]
    fn arithmetic_promotes_to_float_on_mixed_operands() {
        let doc = Document::new();
        let row = RowCtx::single("t", &doc);
        let mut env = NoEnv;
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(Expr::Literal(Literal::Int64(1))),
            right: Box::new(Expr::Literal(Literal::Float64(2.5))),
        };
        assert_eq!(eval(&expr, &row, &mut env).unwrap(), Value::Float64(3.5));
    }

    #[test]
    fn wildcard_path_resolves_every_direct_child() {
        let nested = doc_with(&[("a", FieldValue::Int64(1)), ("b", FieldValue::Int64(5))]);
        let doc = doc_with(&[("child", FieldValue::Document(nested))]);
        let row = RowCtx::single("t", &doc);
        assert_eq!(row.resolve(None, "child.*").len(), 2);
    }

    #[test]
    fn like_supports_percent_and_underscore() {
        assert!(like_match(&Value::String("hello".into()), "h_l%"));
        assert!(!like_match(&Value::String("hello".into()), "world"));
    }

    #[test]
    fn null_equals_null_but_not_non_null() {
        assert!(values_equal(&Value::Null, &Value::Null));
        assert!(!values_equal(&Value::Null, &Value::Int64(0)));
    }

    #[test]
    fn is_null_over_a_wildcard_is_existential() {
        let nested = doc_with(&[("x", FieldValue::Null), ("y", FieldValue::Int64(5))]);
        let doc = doc_with(&[("a", FieldValue::Document(nested))]);
        let row = RowCtx::single("t", &doc);
        let mut env = NoEnv;
        let expr = Expr::IsNull {
            expr: Box::new(Expr::Path { qualifier: None, path: "a.*".to_string() }),
            negated: false,
        };
        // Some child of `a` is null, so `a.* IS NULL` is true even though
        // not every child is, matching the existential quantification used
        // by LIKE/BETWEEN/IN over the same wildcard multi-value.
        assert_eq!(eval(&expr, &row, &mut env).unwrap(), Value::Bool(true));
    }
}
