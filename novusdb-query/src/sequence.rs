//! Named counters created by `CREATE SEQUENCE` and advanced by `NEXTVAL`/
//! read by `CURRVAL` expressions. Persisted as documents in the hidden
//! `_novusdb_sequences` collection, loaded into memory at open, the same
//! shape as [`crate::constraints::ConstraintCatalogue`] and
//! `novusdb_storage::stats::StatsCatalogue`.

use novusdb_storage::document::{Document, FieldValue};
use novusdb_storage::pager::Pager;

use crate::error::{Error, Result};

pub const SEQUENCES_COLLECTION: &str = "_novusdb_sequences";

#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub name: String,
    pub start: i64,
    pub increment: i64,
    pub min: i64,
    pub max: i64,
    pub cycle: bool,
    /// `None` until the first `NEXTVAL`.
    pub current: Option<i64>,
}

impl Sequence {
    fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.push("name", FieldValue::String(self.name.clone()));
        doc.push("start", FieldValue::Int64(self.start));
        doc.push("increment", FieldValue::Int64(self.increment));
        doc.push("min", FieldValue::Int64(self.min));
        doc.push("max", FieldValue::Int64(self.max));
        doc.push("cycle", FieldValue::Bool(self.cycle));
        doc.push(
            "current",
            match self.current {
                Some(v) => FieldValue::Int64(v),
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
        let i64_field = |k: &str| -> Option<i64> {
            match doc.get(k)? {
                FieldValue::Int64(v) => Some(*v),
                _ => None,
            }
        };
        let cycle = matches!(doc.get("cycle")?, FieldValue::Bool(true));
        let current = match doc.get("current") {
            Some(FieldValue::Int64(v)) => Some(*v),
            _ => None,
        };
        Some(Self {
            name,
            start: i64_field("start")?,
            increment: i64_field("increment")?,
            min: i64_field("min")?,
            max: i64_field("max")?,
            cycle,
            current,
        })
    }
}

#[derive(Default)]
pub struct SequenceCatalogue {
    cache: Vec<Sequence>,
}

impl SequenceCatalogue {
    pub fn load(pager: &Pager) -> Result<Self> {
        if !pager.collection_exists(SEQUENCES_COLLECTION) {
            return Ok(Self::default());
        }
        let rows = pager.scan_collection(SEQUENCES_COLLECTION)?;
        let mut cache = Vec::with_capacity(rows.len());
        for (_, bytes) in rows {
            if let Ok(doc) = Document::decode(&bytes) {
                if let Some(s) = Sequence::from_document(&doc) {
                    cache.push(s);
                }
            }
        }
        Ok(Self { cache })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.cache.iter().any(|s| s.name == name)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        pager: &mut Pager,
        name: &str,
        start: i64,
        increment: i64,
        min: i64,
        max: i64,
        cycle: bool,
    ) -> Result<()> {
        let seq = Sequence {
            name: name.to_string(),
            start,
            increment,
            min,
            max,
            cycle,
            current: None,
        };
        let bytes = seq.to_document().encode();
        pager.insert_record(SEQUENCES_COLLECTION, &bytes)?;
        pager.end_statement()?;
        self.cache.retain(|s| s.name != name);
        self.cache.push(seq);
        Ok(())
    }

    pub fn drop(&mut self, pager: &mut Pager, name: &str, if_exists: bool) -> Result<()> {
        if !self.exists(name) {
            return if if_exists {
                Ok(())
            } else {
                Err(Error::UnknownSequence(name.to_string()))
            };
        }
        if pager.collection_exists(SEQUENCES_COLLECTION) {
            for (loc, bytes) in pager.scan_collection(SEQUENCES_COLLECTION)? {
                if let Ok(doc) = Document::decode(&bytes) {
                    if let Some(FieldValue::String(n)) = doc.get("name") {
                        if n == name {
                            pager.mark_deleted(loc)?;
                        }
                    }
                }
            }
            pager.end_statement()?;
        }
        self.cache.retain(|s| s.name != name);
        Ok(())
    }

    fn persist(&self, pager: &mut Pager, seq: &Sequence) -> Result<()> {
        let existing = pager
            .scan_collection(SEQUENCES_COLLECTION)
            .unwrap_or_default()
            .into_iter()
            .find(|(_, bytes)| {
                Document::decode(bytes)
                    .ok()
                    .and_then(|d| match d.get("name") {
                        Some(FieldValue::String(s)) => Some(s == &seq.name),
                        _ => None,
                    })
                    .unwrap_or(false)
            });
        let bytes = seq.to_document().encode();
        if let Some((loc, _)) = existing {
            pager.update_record(SEQUENCES_COLLECTION, loc, &bytes)?;
        } else {
            pager.insert_record(SEQUENCES_COLLECTION, &bytes)?;
        }
        pager.end_statement()
    }

    /// Advances the named sequence and returns the new value, wrapping to
    /// `min`/`max` when `cycle` is set and erroring with `InvalidArgument`
    /// ("sequence exhausted") otherwise.
    pub fn nextval(&mut self, pager: &mut Pager, name: &str) -> Result<i64> {
        let idx = self
            .cache
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::UnknownSequence(name.to_string()))?;

        let next = {
            let seq = &self.cache[idx];
            match seq.current {
                None => seq.start,
                Some(cur) => {
                    let candidate = cur + seq.increment;
                    if seq.increment >= 0 && candidate > seq.max {
                        if seq.cycle {
                            seq.min
                        } else {
                            return Err(Error::InvalidArgument(format!("sequence {name} exhausted")));
                        }
                    } else if seq.increment < 0 && candidate < seq.min {
                        if seq.cycle {
                            seq.max
                        } else {
                            return Err(Error::InvalidArgument(format!("sequence {name} exhausted")));
                        }
                    } else {
                        candidate
                    }
                }
            }
        };

        self.cache[idx].current = Some(next);
        let snapshot = self.cache[idx].clone();
        self.persist(pager, &snapshot)?;
        Ok(next)
    }

    pub fn currval(&self, name: &str) -> Result<i64> {
        let seq = self.cache.iter().find(|s| s.name == name).ok_or_else(|| Error::UnknownSequence(name.to_string()))?;
        seq.current.ok_or_else(|| Error::InvalidArgument(format!("sequence {name} has no current value yet")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novusdb_storage::pager::DbOptions;
    use tempfile::tempdir;

    #[test]
    fn nextval_starts_at_start_then_increments() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("db.ndb"), DbOptions::default()).unwrap();
        let mut cat = SequenceCatalogue::load(&pager).unwrap();
        cat.create(&mut pager, "seq1", 1, 1, 1, 100, false).unwrap();
        assert_eq!(cat.nextval(&mut pager, "seq1").unwrap(), 1);
        assert_eq!(cat.nextval(&mut pager, "seq1").unwrap(), 2);
        assert_eq!(cat.currval("seq1").unwrap(), 2);
    }

    #[test]
    fn cycle_wraps_to_min_at_max() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("db.ndb"), DbOptions::default()).unwrap();
        let mut cat = SequenceCatalogue::load(&pager).unwrap();
        cat.create(&mut pager, "seq1", 1, 1, 1, 2, true).unwrap();
        assert_eq!(cat.nextval(&mut pager, "seq1").unwrap(), 1);
        assert_eq!(cat.nextval(&mut pager, "seq1").unwrap(), 2);
        assert_eq!(cat.nextval(&mut pager, "seq1").unwrap(), 1);
    }

    #[test]
    fn no_cycle_exhausts_with_error() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("db.ndb"), DbOptions::default()).unwrap();
        let mut cat = SequenceCatalogue::load(&pager).unwrap();
        cat.create(&mut pager, "seq1", 1, 1, 1, 1, false).unwrap();
        assert_eq!(cat.nextval(&mut pager, "seq1").unwrap(), 1);
        assert!(cat.nextval(&mut pager, "seq1").is_err());
    }

    #[test]
    fn reload_restores_persisted_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.ndb");
        {
            let mut pager = Pager::open(&path, DbOptions::default()).unwrap();
            let mut cat = SequenceCatalogue::load(&pager).unwrap();
            cat.create(&mut pager, "seq1", 1, 1, 1, 100, false).unwrap();
            cat.nextval(&mut pager, "seq1").unwrap();
            cat.nextval(&mut pager, "seq1").unwrap();
        }
        let pager2 = Pager::open(&path, DbOptions::default()).unwrap();
        let cat2 = SequenceCatalogue::load(&pager2).unwrap();
        assert_eq!(cat2.currval("seq1").unwrap(), 2);
    }
}
