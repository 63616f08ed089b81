//! Per-column table statistics gathered by `ANALYZE`, persisted as documents
//! in the hidden `_novusdb_stats` collection and reloaded into memory at
//! `open` so the query crate's optimizer never has to touch the Pager to
//! estimate selectivity.

use ordered_float::OrderedFloat;

use crate::document::{Document, FieldValue};
use crate::error::{Error, Result};
use crate::pager::Pager;

/// Collection name `ANALYZE` results are persisted under. Hidden from
/// `SELECT * FROM` / catalogue listings the way `_novusdb_constraints` is.
pub const STATS_COLLECTION: &str = "_novusdb_stats";

pub const DEFAULT_HISTOGRAM_BUCKETS: usize = 10;

/// Bucket bounds are `OrderedFloat` so the histogram as a whole (and
/// `TableStats` transitively) can derive a total-order `PartialEq`/`Eq`
/// the way sortable index keys already do in `index/ordered_key.rs`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
    pub lower: OrderedFloat<f64>,
    pub upper: OrderedFloat<f64>,
    pub count: u64,
    pub ndv: u64,
}

/// Either bound of a min/max pair, numeric or string-typed depending on what
/// the column actually held the most often.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Numeric(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub field: String,
    pub count_present: u64,
    pub null_count: u64,
    pub ndv: u64,
    pub min: Option<Bound>,
    pub max: Option<Bound>,
    pub mean_string_length: Option<f64>,
    pub histogram: Vec<HistogramBucket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableStats {
    pub table: String,
    pub row_count: u64,
    pub page_count: u64,
    pub analyzed_at: i64,
    pub columns: Vec<ColumnStats>,
}

impl TableStats {
    pub fn column(&self, field: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|c| c.field == field)
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.push("table", FieldValue::String(self.table.clone()));
        doc.push("row_count", FieldValue::Int64(self.row_count as i64));
        doc.push("page_count", FieldValue::Int64(self.page_count as i64));
        doc.push("analyzed_at", FieldValue::Int64(self.analyzed_at));

        let columns = self
            .columns
            .iter()
            .map(|c| FieldValue::Document(column_to_document(c)))
            .collect();
        doc.push("columns", FieldValue::Array(columns));
        doc
    }

    pub fn from_document(doc: &Document) -> Option<Self> {
        let table = match doc.get("table")? {
            FieldValue::String(s) => s.clone(),
            _ => return None,
        };
        let row_count = as_u64(doc.get("row_count")?)?;
        let page_count = as_u64(doc.get("page_count")?)?;
        let analyzed_at = match doc.get("analyzed_at")? {
            FieldValue::Int64(v) => *v,
            _ => return None,
        };
        let columns = match doc.get("columns")? {
            FieldValue::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    FieldValue::Document(d) => column_from_document(d),
                    _ => None,
                })
                .collect(),
            _ => return None,
        };

        Some(Self {
            table,
            row_count,
            page_count,
            analyzed_at,
            columns,
        })
    }
}

fn column_to_document(c: &ColumnStats) -> Document {
    let mut doc = Document::new();
    doc.push("field", FieldValue::String(c.field.clone()));
    doc.push("count_present", FieldValue::Int64(c.count_present as i64));
    doc.push("null_count", FieldValue::Int64(c.null_count as i64));
    doc.push("ndv", FieldValue::Int64(c.ndv as i64));
    doc.push("min", bound_to_value(&c.min));
    doc.push("max", bound_to_value(&c.max));
    doc.push(
        "mean_string_length",
        match c.mean_string_length {
            Some(v) => FieldValue::Float64(v),
            None => FieldValue::Null,
        },
    );
    let buckets = c
        .histogram
        .iter()
        .map(|b| {
            let mut bd = Document::new();
            bd.push("lower", FieldValue::Float64(b.lower.into_inner()));
            bd.push("upper", FieldValue::Float64(b.upper.into_inner()));
            bd.push("count", FieldValue::Int64(b.count as i64));
            bd.push("ndv", FieldValue::Int64(b.ndv as i64));
            FieldValue::Document(bd)
        })
        .collect();
    doc.push("histogram", FieldValue::Array(buckets));
    doc
}

fn column_from_document(doc: &Document) -> Option<ColumnStats> {
    let field = match doc.get("field")? {
        FieldValue::String(s) => s.clone(),
        _ => return None,
    };
    let count_present = as_u64(doc.get("count_present")?)?;
    let null_count = as_u64(doc.get("null_count")?)?;
    let ndv = as_u64(doc.get("ndv")?)?;
    let min = doc.get("min").and_then(value_to_bound);
    let max = doc.get("max").and_then(value_to_bound);
    let mean_string_length = match doc.get("mean_string_length") {
        Some(FieldValue::Float64(v)) => Some(*v),
        _ => None,
    };
    let histogram = match doc.get("histogram")? {
        FieldValue::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                FieldValue::Document(bd) => Some(HistogramBucket {
                    lower: OrderedFloat(as_f64(bd.get("lower")?)?),
                    upper: OrderedFloat(as_f64(bd.get("upper")?)?),
                    count: as_u64(bd.get("count")?)?,
                    ndv: as_u64(bd.get("ndv")?)?,
                }),
                _ => None,
            })
            .collect(),
        _ => return None,
    };

    Some(ColumnStats {
        field,
        count_present,
        null_count,
        ndv,
        min,
        max,
        mean_string_length,
        histogram,
    })
}

fn bound_to_value(bound: &Option<Bound>) -> FieldValue {
    match bound {
        Some(Bound::Numeric(v)) => FieldValue::Float64(*v),
        Some(Bound::Text(s)) => FieldValue::String(s.clone()),
        None => FieldValue::Null,
    }
}

fn value_to_bound(v: &FieldValue) -> Option<Bound> {
    match v {
        FieldValue::Float64(f) => Some(Bound::Numeric(*f)),
        FieldValue::Int64(i) => Some(Bound::Numeric(*i as f64)),
        FieldValue::String(s) => Some(Bound::Text(s.clone())),
        _ => None,
    }
}

fn as_u64(v: &FieldValue) -> Option<u64> {
    match v {
        FieldValue::Int64(i) => Some(*i as u64),
        _ => None,
    }
}

fn as_f64(v: &FieldValue) -> Option<f64> {
    match v {
        FieldValue::Float64(f) => Some(*f),
        FieldValue::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

/// Loads, replaces and fetches `TableStats` rows from `_novusdb_stats`.
/// Kept separate from `Pager` itself (unlike collections/indexes/views,
/// these rows are opaque documents, not structural metadata) but uses the
/// same Pager record operations everything else does.
pub struct StatsCatalogue {
    cache: Vec<TableStats>,
}

impl StatsCatalogue {
    /// Scans `_novusdb_stats` (if it exists) and populates the in-memory
    /// cache. Called once from `Pager::open`'s caller at startup.
    pub fn load(pager: &Pager) -> Result<Self> {
        if !pager.collection_exists(STATS_COLLECTION) {
            return Ok(Self { cache: Vec::new() });
        }
        let rows = pager.scan_collection(STATS_COLLECTION)?;
        let mut cache = Vec::with_capacity(rows.len());
        for (loc, bytes) in rows {
            let doc = Document::decode(&bytes).map_err(|_| Error::CorruptRecord {
                page_id: loc.page_id,
                slot_offset: loc.slot_offset,
                reason: "invalid stats document",
            })?;
            if let Some(stats) = TableStats::from_document(&doc) {
                cache.push(stats);
            }
        }
        Ok(Self { cache })
    }

    pub fn get(&self, table: &str) -> Option<&TableStats> {
        self.cache.iter().find(|s| s.table == table)
    }

    pub fn all(&self) -> &[TableStats] {
        &self.cache
    }

    /// Replaces any existing row for `stats.table`, persisting the document
    /// and updating the in-memory cache.
    pub fn put(&mut self, pager: &mut Pager, stats: TableStats) -> Result<()> {
        let existing = pager
            .scan_collection(STATS_COLLECTION)
            .unwrap_or_default()
            .into_iter()
            .find(|(_, bytes)| {
                Document::decode(bytes)
                    .ok()
                    .and_then(|d| match d.get("table") {
                        Some(FieldValue::String(s)) => Some(s == &stats.table),
                        _ => None,
                    })
                    .unwrap_or(false)
            });

        let bytes = stats.to_document().encode();
        if let Some((loc, _)) = existing {
            pager.update_record(STATS_COLLECTION, loc, &bytes)?;
        } else {
            pager.insert_record(STATS_COLLECTION, &bytes)?;
        }
        pager.end_statement()?;

        self.cache.retain(|s| s.table != stats.table);
        self.cache.push(stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::DbOptions;
    use tempfile::tempdir;

    fn sample(table: &str) -> TableStats {
        TableStats {
            table: table.to_string(),
            row_count: 100,
            page_count: 4,
            analyzed_at: 1_700_000_000,
            columns: vec![ColumnStats {
                field: "salary".to_string(),
                count_present: 100,
                null_count: 0,
                ndv: 50,
                min: Some(Bound::Numeric(1000.0)),
                max: Some(Bound::Numeric(100000.0)),
                mean_string_length: None,
                histogram: vec![HistogramBucket {
                    lower: OrderedFloat(1000.0),
                    upper: OrderedFloat(10900.0),
                    count: 10,
                    ndv: 10,
                }],
            }],
        }
    }

    #[test]
    fn document_roundtrip_preserves_histogram() {
        let stats = sample("bigtest");
        let doc = stats.to_document();
        let back = TableStats::from_document(&doc).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn catalogue_put_then_reload() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("db.ndb"), DbOptions::default()).unwrap();
        let mut cat = StatsCatalogue::load(&pager).unwrap();
        cat.put(&mut pager, sample("bigtest")).unwrap();

        let reloaded = StatsCatalogue::load(&pager).unwrap();
        assert_eq!(reloaded.get("bigtest"), Some(&sample("bigtest")));
    }

    #[test]
    fn replacing_a_table_s_stats_keeps_one_row() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("db.ndb"), DbOptions::default()).unwrap();
        let mut cat = StatsCatalogue::load(&pager).unwrap();
        cat.put(&mut pager, sample("bigtest")).unwrap();
        let mut updated = sample("bigtest");
        updated.row_count = 200;
        cat.put(&mut pager, updated).unwrap();

        assert_eq!(cat.all().len(), 1);
        assert_eq!(cat.get("bigtest").unwrap().row_count, 200);
    }
}
