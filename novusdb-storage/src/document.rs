//! Typed document codec: ordered named fields, nested documents and arrays.

use std::fmt;

/// A single field value. Preserves the declared type across encode/decode.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Document(Document),
    Array(Vec<FieldValue>),
}

const TYPE_NULL: u8 = 0;
const TYPE_STRING: u8 = 1;
const TYPE_INT64: u8 = 2;
const TYPE_FLOAT64: u8 = 3;
const TYPE_BOOL: u8 = 4;
const TYPE_DOCUMENT: u8 = 5;
const TYPE_ARRAY: u8 = 6;

/// An ordered sequence of named fields. Field order is significant and is
/// preserved exactly across `encode`/`decode`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Vec<(String, FieldValue)>,
}

#[derive(Debug)]
pub enum DecodeError {
    UnexpectedEof,
    InvalidUtf8,
    UnknownType(u8),
    LengthOverflow,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of document bytes"),
            DecodeError::InvalidUtf8 => write!(f, "invalid utf-8 in document string"),
            DecodeError::UnknownType(t) => write!(f, "unknown field type tag {t}"),
            DecodeError::LengthOverflow => write!(f, "length prefix exceeds remaining bytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            fields: Vec::with_capacity(cap),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Navigate a dotted path (`a.b.c`), without wildcard expansion.
    /// A path through a non-document value yields `None`.
    pub fn get_path(&self, path: &str) -> Option<&FieldValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for seg in segments {
            match current {
                FieldValue::Document(doc) => current = doc.get(seg)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_document_into(self, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut pos = 0usize;
        let doc = decode_document(bytes, &mut pos)?;
        Ok(doc)
    }
}

fn encode_document_into(doc: &Document, out: &mut Vec<u8>) {
    let num_fields = u16::try_from(doc.fields.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&num_fields.to_le_bytes());
    for (name, value) in &doc.fields {
        let name_bytes = name.as_bytes();
        let name_len = u16::try_from(name_bytes.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name_bytes);
        encode_value_into(value, out);
    }
}

fn encode_value_into(value: &FieldValue, out: &mut Vec<u8>) {
    match value {
        FieldValue::Null => out.push(TYPE_NULL),
        FieldValue::String(s) => {
            out.push(TYPE_STRING);
            let bytes = s.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        FieldValue::Int64(i) => {
            out.push(TYPE_INT64);
            out.extend_from_slice(&i.to_le_bytes());
        }
        FieldValue::Float64(f) => {
            out.push(TYPE_FLOAT64);
            out.extend_from_slice(&f.to_le_bytes());
        }
        FieldValue::Bool(b) => {
            out.push(TYPE_BOOL);
            out.push(u8::from(*b));
        }
        FieldValue::Document(inner) => {
            out.push(TYPE_DOCUMENT);
            let mut inner_bytes = Vec::new();
            encode_document_into(inner, &mut inner_bytes);
            out.extend_from_slice(&(inner_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&inner_bytes);
        }
        FieldValue::Array(items) => {
            out.push(TYPE_ARRAY);
            let count = u16::try_from(items.len()).unwrap_or(u16::MAX);
            out.extend_from_slice(&count.to_le_bytes());
            for item in items {
                encode_value_into(item, out);
            }
        }
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], DecodeError> {
    if *pos + n > bytes.len() {
        return Err(DecodeError::UnexpectedEof);
    }
    let slice = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

fn decode_document(bytes: &[u8], pos: &mut usize) -> Result<Document, DecodeError> {
    let num_fields = u16::from_le_bytes(take(bytes, pos, 2)?.try_into().unwrap());
    let mut doc = Document::with_capacity(num_fields as usize);
    for _ in 0..num_fields {
        let name_len = u16::from_le_bytes(take(bytes, pos, 2)?.try_into().unwrap()) as usize;
        let name_bytes = take(bytes, pos, name_len)?;
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
        let value = decode_value(bytes, pos)?;
        doc.fields.push((name, value));
    }
    Ok(doc)
}

fn decode_value(bytes: &[u8], pos: &mut usize) -> Result<FieldValue, DecodeError> {
    let ty = take(bytes, pos, 1)?[0];
    match ty {
        TYPE_NULL => Ok(FieldValue::Null),
        TYPE_STRING => {
            let len = u32::from_le_bytes(take(bytes, pos, 4)?.try_into().unwrap()) as usize;
            let s = take(bytes, pos, len)?;
            String::from_utf8(s.to_vec())
                .map(FieldValue::String)
                .map_err(|_| DecodeError::InvalidUtf8)
        }
        TYPE_INT64 => {
            let v = i64::from_le_bytes(take(bytes, pos, 8)?.try_into().unwrap());
            Ok(FieldValue::Int64(v))
        }
        TYPE_FLOAT64 => {
            let v = f64::from_le_bytes(take(bytes, pos, 8)?.try_into().unwrap());
            Ok(FieldValue::Float64(v))
        }
        TYPE_BOOL => {
            let v = take(bytes, pos, 1)?[0];
            Ok(FieldValue::Bool(v != 0))
        }
        TYPE_DOCUMENT => {
            let len = u32::from_le_bytes(take(bytes, pos, 4)?.try_into().unwrap()) as usize;
            if *pos + len > bytes.len() {
                return Err(DecodeError::LengthOverflow);
            }
            let end = *pos + len;
            let inner = decode_document(&bytes[..end], pos)?;
            Ok(FieldValue::Document(inner))
        }
        TYPE_ARRAY => {
            let count = u16::from_le_bytes(take(bytes, pos, 2)?.try_into().unwrap());
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(bytes, pos)?);
            }
            Ok(FieldValue::Array(items))
        }
        other => Err(DecodeError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_fields() {
        let mut doc = Document::new();
        doc.push("name", FieldValue::String("Alice".into()));
        doc.push("age", FieldValue::Int64(30));
        doc.push("score", FieldValue::Float64(1.5));
        doc.push("active", FieldValue::Bool(true));
        doc.push("nickname", FieldValue::Null);

        let bytes = doc.encode();
        let decoded = Document::decode(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn round_trips_nested_document_and_array() {
        let mut inner = Document::new();
        inner.push("city", FieldValue::String("Berlin".into()));
        inner.push("zip", FieldValue::Int64(10115));

        let mut doc = Document::new();
        doc.push("address", FieldValue::Document(inner));
        doc.push(
            "tags",
            FieldValue::Array(vec![
                FieldValue::String("a".into()),
                FieldValue::String("b".into()),
                FieldValue::Int64(3),
            ]),
        );

        let bytes = doc.encode();
        let decoded = Document::decode(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn preserves_field_order() {
        let mut doc = Document::new();
        doc.push("z", FieldValue::Int64(1));
        doc.push("a", FieldValue::Int64(2));
        doc.push("m", FieldValue::Int64(3));

        let bytes = doc.encode();
        let decoded = Document::decode(&bytes).unwrap();
        let names: Vec<&str> = decoded.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn get_path_navigates_nested_documents() {
        let mut inner = Document::new();
        inner.push("city", FieldValue::String("Berlin".into()));
        let mut doc = Document::new();
        doc.push("address", FieldValue::Document(inner));

        assert_eq!(
            doc.get_path("address.city"),
            Some(&FieldValue::String("Berlin".into()))
        );
        assert_eq!(doc.get_path("address.missing"), None);
        assert_eq!(doc.get_path("missing.city"), None);
    }

    #[test]
    fn truncated_bytes_error_instead_of_panic() {
        let mut doc = Document::new();
        doc.push("name", FieldValue::String("Alice".into()));
        let bytes = doc.encode();
        let truncated = &bytes[..bytes.len() - 2];
        assert!(Document::decode(truncated).is_err());
    }
}
