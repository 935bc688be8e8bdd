//! Schema declaration and the `binary`/`string`/`table` wire encodings.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{QueueError, Result};

fn field_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-zA-Z]+$").unwrap())
}

/// The three field encodings a schema entry can declare, each with an
/// independent `optional` modifier (`table` only supports `optional`).
///
/// The source's `*` ("by-reference") modifier has no separate runtime
/// flag here: a caller opts into passing a borrowed buffer at `add`
/// time simply by constructing `FieldValue::BinaryRef` instead of
/// `FieldValue::Binary`, for any `binary` field regardless of how the
/// schema was declared. `get` always hands back an owned value — a
/// filesystem read has no buffer to borrow from — so there is nothing
/// for a schema-level flag to gate on the decode side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Binary,
    String,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldType {
    pub kind: FieldKind,
    pub optional: bool,
}

impl FieldType {
    pub fn binary() -> Self {
        FieldType {
            kind: FieldKind::Binary,
            optional: false,
        }
    }
    pub fn string() -> Self {
        FieldType {
            kind: FieldKind::String,
            optional: false,
        }
    }
    pub fn table() -> Self {
        FieldType {
            kind: FieldKind::Table,
            optional: false,
        }
    }
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A single field value. A "by-reference" declaration is represented
/// here by the borrowed `Ref` variants rather than a runtime flag, so
/// callers opt in by choosing the variant, not by passing a bool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Binary(Vec<u8>),
    BinaryRef(&'a [u8]),
    String(String),
    Table(BTreeMap<String, String>),
}

impl<'a> FieldValue<'a> {
    fn as_bytes_for_encode(&self) -> Result<Vec<u8>> {
        match self {
            FieldValue::Binary(b) => Ok(b.clone()),
            FieldValue::BinaryRef(b) => Ok(b.to_vec()),
            FieldValue::String(s) => Ok(s.as_bytes().to_vec()),
            FieldValue::Table(map) => Ok(encode_table(map)),
        }
    }
}

/// An owned, decoded field value handed back from `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Binary(Vec<u8>),
    String(String),
    Table(BTreeMap<String, String>),
}

/// A queue's field declarations, in the order they were added (field
/// files are nonetheless independent of order; `table` serialization
/// always sorts by key regardless of map iteration order).
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<(String, FieldType)>,
}

impl Schema {
    pub fn new() -> Self {
        Schema { fields: Vec::new() }
    }

    /// Builds and validates a schema from an ordered field list. Rejects
    /// a schema with no mandatory field, and any field named `locked` or
    /// containing characters outside `[0-9a-zA-Z]`.
    pub fn build(fields: Vec<(String, FieldType)>) -> Result<Self> {
        if fields.is_empty() {
            return Err(QueueError::InvalidOption(
                "schema must declare at least one field".to_owned(),
            ));
        }
        let mut has_mandatory = false;
        for (name, ty) in &fields {
            if name == "locked" {
                return Err(QueueError::InvalidOption(
                    "field name 'locked' is reserved".to_owned(),
                ));
            }
            if !field_name_regex().is_match(name) {
                return Err(QueueError::InvalidOption(format!(
                    "invalid field name '{name}'"
                )));
            }
            if !ty.optional {
                has_mandatory = true;
            }
        }
        if !has_mandatory {
            return Err(QueueError::InvalidOption(
                "schema must declare at least one mandatory field".to_owned(),
            ));
        }
        Ok(Schema { fields })
    }

    pub fn fields(&self) -> &[(String, FieldType)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// Encode a field value per its declared type. `string` rejects any
/// value that isn't a well-formed sequence of Unicode scalar values
/// (surrogate halves included) with `InvalidEncoding`.
pub fn encode(field: &str, ty: &FieldType, value: &FieldValue) -> Result<Vec<u8>> {
    match (ty.kind, value) {
        (FieldKind::Binary, FieldValue::Binary(_) | FieldValue::BinaryRef(_)) => {
            value.as_bytes_for_encode()
        }
        (FieldKind::String, FieldValue::String(s)) => {
            // `&str` is type-guaranteed to hold only well-formed Unicode
            // scalar value sequences, so invalid encodings can only ever
            // be observed on the decode side (raw bytes read back from
            // disk that don't happen to be valid UTF-8).
            Ok(s.as_bytes().to_vec())
        }
        (FieldKind::Table, FieldValue::Table(map)) => Ok(encode_table(map)),
        _ => Err(QueueError::InvalidField {
            field: field.to_owned(),
            reason: "value does not match declared field type".to_owned(),
        }),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('t') => out.push('\t'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn encode_table(map: &BTreeMap<String, String>) -> Vec<u8> {
    // `BTreeMap` already iterates in sorted key order, but the sort is
    // restated explicitly here since it's a hard requirement independent
    // of the map type a caller hands in.
    let mut entries: Vec<(&String, &String)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let mut out = String::new();
    for (k, v) in entries {
        out.push_str(&escape(k));
        out.push('\t');
        out.push_str(&escape(v));
        out.push('\n');
    }
    out.into_bytes()
}

/// Decode a `table` field. Rejects any line not matching
/// `^[^\t\n]*\t[^\t\n]*$` with `MalformedTable`. Duplicate keys are
/// tolerated: last one wins.
///
/// `split_terminator` (not `split`) so only the one trailing empty
/// segment after a well-formed blob's final `\n` is dropped; a blank
/// line *inside* corrupted data still reaches the regex check below
/// and is rejected, rather than silently skipped.
pub fn decode_table(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    let text = String::from_utf8(bytes.to_vec())
        .map_err(|_| QueueError::MalformedTable("non-UTF-8 table data".to_owned()))?;
    let mut map = BTreeMap::new();
    for line in text.split_terminator('\n') {
        let mut parts = line.splitn(2, '\t');
        let key = parts.next();
        let value = parts.next();
        match (key, value) {
            (Some(k), Some(v)) if !v.contains('\t') => {
                map.insert(unescape(k), unescape(v));
            }
            _ => return Err(QueueError::MalformedTable(line.to_owned())),
        }
    }
    Ok(map)
}

/// Decode raw bytes per field type into an owned, caller-facing value.
pub fn decode(field: &str, ty: &FieldType, bytes: Vec<u8>) -> Result<DecodedValue> {
    match ty.kind {
        FieldKind::Binary => Ok(DecodedValue::Binary(bytes)),
        FieldKind::String => String::from_utf8(bytes)
            .map(DecodedValue::String)
            .map_err(|_| QueueError::InvalidEncoding(field.to_owned())),
        FieldKind::Table => decode_table(&bytes).map(DecodedValue::Table),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_schema_with_no_mandatory_field() {
        let err = Schema::build(vec![("a".to_owned(), FieldType::string().optional())])
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOption(_)));
    }

    #[test]
    fn rejects_locked_field_name() {
        let err = Schema::build(vec![("locked".to_owned(), FieldType::binary())]).unwrap_err();
        assert!(matches!(err, QueueError::InvalidOption(_)));
    }

    #[test]
    fn table_roundtrip_sorts_and_escapes() {
        let mut map = BTreeMap::new();
        map.insert("b".to_owned(), "2".to_owned());
        map.insert("a".to_owned(), "1\ttab\nnewline\\backslash".to_owned());
        let bytes = encode_table(&map);
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("a\t"));
        let decoded = decode_table(&bytes).unwrap();
        assert_eq!(map, decoded);
    }

    #[test]
    fn table_encoding_sorts_keys_with_tab_newline_separators() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), "1".to_owned());
        map.insert("b".to_owned(), "2".to_owned());
        assert_eq!(b"a\t1\nb\t2\n".to_vec(), encode_table(&map));
    }

    #[test]
    fn malformed_table_line_rejected() {
        let err = decode_table(b"no-tab-here\n").unwrap_err();
        assert!(matches!(err, QueueError::MalformedTable(_)));
    }

    #[test]
    fn blank_line_amid_corrupted_table_data_is_rejected() {
        let err = decode_table(b"a\t1\n\nb\t2\n").unwrap_err();
        assert!(matches!(err, QueueError::MalformedTable(_)));
    }

    #[test]
    fn empty_table_decodes_to_empty_map() {
        assert_eq!(BTreeMap::new(), decode_table(b"").unwrap());
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let decoded = decode_table(b"a\t1\na\t2\n").unwrap();
        assert_eq!(Some(&"2".to_owned()), decoded.get("a"));
    }

    #[test]
    fn string_roundtrip_is_utf8_exact() {
        let ty = FieldType::string();
        let value = FieldValue::String("Th\u{e9}\u{e2}tre Fran\u{e7}ais".to_owned());
        let bytes = encode("body", &ty, &value).unwrap();
        assert_eq!(
            "Th\u{e9}\u{e2}tre Fran\u{e7}ais".as_bytes().to_vec(),
            bytes
        );
        let decoded = decode("body", &ty, bytes).unwrap();
        assert_eq!(
            DecodedValue::String("Th\u{e9}\u{e2}tre Fran\u{e7}ais".to_owned()),
            decoded
        );
    }
}
