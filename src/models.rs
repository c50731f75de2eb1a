//! Core data models shared by the import and export pipelines.
//!
//! [`RawRecord`] is the loosely-typed shape every parser produces;
//! [`ValidationOutcome`] is what every rejected record turns into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The three importable/exportable resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Users,
    Articles,
    Comments,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Users => "users",
            ResourceKind::Articles => "articles",
            ResourceKind::Comments => "comments",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(ResourceKind::Users),
            "articles" => Ok(ResourceKind::Articles),
            "comments" => Ok(ResourceKind::Comments),
            other => Err(format!(
                "unknown resource '{}': must be users, articles, or comments",
                other
            )),
        }
    }
}

/// File format of an import source or export output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    Ndjson,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Ndjson => "ndjson",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Csv => "text/csv; charset=utf-8",
            Format::Ndjson => "application/x-ndjson",
        }
    }

    /// Detects the format from a file name or URL path.
    pub fn from_path(path: &str) -> Option<Format> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Format::Csv),
            "ndjson" | "jsonl" | "json" => Some(Format::Ndjson),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(Format::Csv),
            "ndjson" => Ok(Format::Ndjson),
            other => Err(format!("unknown format '{}': must be csv or ndjson", other)),
        }
    }
}

/// One parsed record: field name to value, in source order.
///
/// CSV sources only produce string values; NDJSON values may be any JSON.
/// Accessors trim and stringify so validators don't care which parser
/// produced the record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Trimmed text form of a field. Missing and `null` read as empty.
    pub fn text(&self, field: &str) -> String {
        match self.fields.get(field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }
    }

    pub fn is_blank(&self, field: &str) -> bool {
        self.text(field).is_empty()
    }

    /// The record's own identifier, if it carries a non-blank one.
    pub fn id(&self) -> Option<String> {
        Some(self.text("id")).filter(|id| !id.is_empty())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = RawRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// A single field-level complaint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Verdict for one source record. Rejected outcomes end up in the job's
/// error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub row_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl ValidationOutcome {
    pub fn new(row_number: u64, record_id: Option<String>) -> Self {
        Self {
            row_number,
            record_id,
            valid: true,
            errors: Vec::new(),
        }
    }

    /// Synthetic entry recorded when a job dies on a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        let mut outcome = Self::new(0, None);
        outcome.add_error("job", message);
        outcome
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn has_error_on(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

/// Canonical timestamp rendering used by every export format.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Stored epoch seconds back to a timestamp; out-of-range values clamp to the epoch.
pub fn ts_from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_trims_and_stringifies() {
        let mut record = RawRecord::new();
        record.insert("email", "  a@b.io ");
        record.insert("active", json!(true));
        record.insert("count", json!(3));
        record.insert("nothing", Value::Null);

        assert_eq!(record.text("email"), "a@b.io");
        assert_eq!(record.text("active"), "true");
        assert_eq!(record.text("count"), "3");
        assert_eq!(record.text("nothing"), "");
        assert_eq!(record.text("missing"), "");
        assert!(record.is_blank("missing"));
    }

    #[test]
    fn record_preserves_source_order() {
        let record: RawRecord = vec![("z", "1"), ("a", "2"), ("m", "3")]
            .into_iter()
            .collect();
        let keys: Vec<&String> = record.fields.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn blank_id_is_none() {
        let record: RawRecord = vec![("id", "   ")].into_iter().collect();
        assert_eq!(record.id(), None);
    }

    #[test]
    fn format_from_path() {
        assert_eq!(Format::from_path("users.CSV"), Some(Format::Csv));
        assert_eq!(Format::from_path("dump.jsonl"), Some(Format::Ndjson));
        assert_eq!(
            Format::from_path("https://x.io/a.ndjson?sig=1"),
            Some(Format::Ndjson)
        );
        assert_eq!(Format::from_path("README"), None);
    }

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let outcome = ValidationOutcome::new(4, None);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json, json!({"row_number": 4, "valid": true}));
    }

    #[test]
    fn add_error_invalidates() {
        let mut outcome = ValidationOutcome::new(2, Some("u1".into()));
        outcome.add_error("email", "email is required");
        assert!(!outcome.valid);
        assert!(outcome.has_error_on("email"));
    }
}
