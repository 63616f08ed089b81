//! Fixed-width, lexicographically sortable encoding of index key values.
//!
//! This is intentionally distinct from `Document`'s WAL/record encoding,
//! which uses little-endian numbers unsuited to byte-order comparison.
//! Numeric values use bias-xored big-endian integers and IEEE-754
//! total-order float rearrangement so that byte-lexicographic order matches
//! numeric order; strings pass through with `0x00`-byte stuffing so an
//! embedded NUL cannot break ordering relative to the terminator.
//!
//! Total ordering across types: `Bool < Int < Float < String`. Null values
//! are never indexed — callers must skip them before reaching this module.

use crate::document::FieldValue;

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;

/// Encodes a value for use as (part of) a sortable index key. Returns `None`
/// for values that cannot be indexed (`Null`, `Document`, `Array`) — the
/// index-maintaining code must skip absent/non-indexable values rather than
/// insert a key for them.
pub fn encode_sortable_key(v: &FieldValue) -> Option<Vec<u8>> {
    match v {
        FieldValue::Null => None,
        FieldValue::Bool(b) => Some(vec![TAG_BOOL, u8::from(*b)]),
        FieldValue::Int64(i) => {
            let mut out = Vec::with_capacity(1 + 8);
            out.push(TAG_INT);
            let u = (*i as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&u.to_be_bytes());
            Some(out)
        }
        FieldValue::Float64(f) => {
            let mut out = Vec::with_capacity(1 + 8);
            out.push(TAG_FLOAT);
            let bits = f.to_bits();
            let sortable = if (bits & (1 << 63)) != 0 {
                !bits
            } else {
                bits ^ (1 << 63)
            };
            out.extend_from_slice(&sortable.to_be_bytes());
            Some(out)
        }
        FieldValue::String(s) => {
            let mut out = Vec::with_capacity(1 + s.len() + 2);
            out.push(TAG_STRING);
            for &b in s.as_bytes() {
                if b == 0x00 {
                    out.push(0x00);
                    out.push(0xFF);
                } else {
                    out.push(b);
                }
            }
            out.push(0x00);
            out.push(0x00);
            Some(out)
        }
        FieldValue::Document(_) | FieldValue::Array(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_ordered(values: Vec<FieldValue>) {
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| encode_sortable_key(v).unwrap())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted, "ordered encoding does not preserve order");
    }

    #[test]
    fn ordered_bool_int_float_string() {
        assert_ordered(vec![
            FieldValue::Bool(false),
            FieldValue::Bool(true),
            FieldValue::Int64(i64::MIN),
            FieldValue::Int64(-1),
            FieldValue::Int64(0),
            FieldValue::Int64(1),
            FieldValue::Int64(i64::MAX),
            FieldValue::Float64(f64::NEG_INFINITY),
            FieldValue::Float64(-1.0),
            FieldValue::Float64(-0.0),
            FieldValue::Float64(0.0),
            FieldValue::Float64(1.0),
            FieldValue::Float64(f64::INFINITY),
            FieldValue::String("".into()),
            FieldValue::String("A".into()),
            FieldValue::String("B".into()),
            FieldValue::String("a".into()),
            FieldValue::String("aa".into()),
        ]);
    }

    #[test]
    fn ordered_string_with_nul_byte() {
        let a = FieldValue::String("a".into());
        let a_nul = FieldValue::String("a\0".into());
        let a_nul_x = FieldValue::String("a\0x".into());
        let b = FieldValue::String("b".into());

        let encoded = vec![
            encode_sortable_key(&a).unwrap(),
            encode_sortable_key(&a_nul).unwrap(),
            encode_sortable_key(&a_nul_x).unwrap(),
            encode_sortable_key(&b).unwrap(),
        ];
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn null_and_nested_values_are_not_indexable() {
        assert_eq!(encode_sortable_key(&FieldValue::Null), None);
        assert_eq!(
            encode_sortable_key(&FieldValue::Array(vec![FieldValue::Int64(1)])),
            None
        );
    }
}
