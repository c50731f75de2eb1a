//! Normalization helpers: identifiers, timestamps and type coercion.
//!
//! The per-resource `normalize` functions are assembled from these. They
//! only ever see records that already passed validation and the identity
//! admission gate, so coercions fall back to defaults instead of failing.

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{RawRecord, ValidationOutcome};

/// How a resource kind obtains its primary identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// A natural key exists; a missing id is generated.
    Generate,
    /// No natural key exists; the source must supply the id.
    Require,
}

/// Identity gate applied between validation and normalization.
///
/// Records of a [`IdentityPolicy::Require`] kind that arrive without an id
/// are rejected here rather than given a fresh one, since a generated id
/// would make every re-import create a duplicate.
pub fn admit(
    record: &RawRecord,
    row: u64,
    policy: IdentityPolicy,
) -> Result<(), ValidationOutcome> {
    match policy {
        IdentityPolicy::Generate => Ok(()),
        IdentityPolicy::Require if record.id().is_some() => Ok(()),
        IdentityPolicy::Require => {
            let mut outcome = ValidationOutcome::new(row, None);
            outcome.add_error("id", "id is required");
            Err(outcome)
        }
    }
}

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The supplied id, or a fresh one.
pub fn id_or_generate(record: &RawRecord) -> String {
    record.id().unwrap_or_else(generate_id)
}

/// Current time truncated to whole seconds, the storage resolution.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Strict RFC 3339. Anything else, including bare dates, is rejected.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc).trunc_subsecs(0))
}

/// Parsed timestamp of `field`, or `now` when absent or unparsable.
pub fn timestamp_or(record: &RawRecord, field: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    parse_timestamp(&record.text(field)).unwrap_or(now)
}

/// Optional timestamp: `None` when blank, `now` when present but unparsable.
pub fn optional_timestamp(
    record: &RawRecord,
    field: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let text = record.text(field);
    if text.is_empty() {
        None
    } else {
        Some(parse_timestamp(&text).unwrap_or(now))
    }
}

/// Boolean flag from a JSON bool or a case-insensitive "true"/"false".
pub fn coerce_bool(record: &RawRecord, field: &str) -> bool {
    match record.get(field) {
        Some(Value::Bool(b)) => *b,
        _ => record.text(field).eq_ignore_ascii_case("true"),
    }
}

/// Tag list from a JSON array or a comma-separated string. Entries are
/// trimmed and blanks dropped.
pub fn coerce_tags(record: &RawRecord, field: &str) -> Vec<String> {
    match record.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|tag| !tag.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn require_policy_rejects_missing_id() {
        let record: RawRecord = vec![("body", "hi")].into_iter().collect();
        let outcome = admit(&record, 7, IdentityPolicy::Require).unwrap_err();
        assert_eq!(outcome.row_number, 7);
        assert!(outcome.has_error_on("id"));

        assert!(admit(&record, 7, IdentityPolicy::Generate).is_ok());
    }

    #[test]
    fn strict_timestamps() {
        let ts = parse_timestamp("2024-03-01T10:20:30.900+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 8, 20, 30).unwrap());
        assert!(parse_timestamp("2024-03-01").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn optional_timestamp_falls_back_to_now() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let record: RawRecord = vec![("a", ""), ("b", "garbage")].into_iter().collect();
        assert_eq!(optional_timestamp(&record, "a", now), None);
        assert_eq!(optional_timestamp(&record, "b", now), Some(now));
        assert_eq!(timestamp_or(&record, "missing", now), now);
    }

    #[test]
    fn tags_from_string_or_array() {
        let mut record = RawRecord::new();
        record.insert("csv", " rust, ,sql ,");
        record.insert("json", json!(["a", " b ", ""]));
        assert_eq!(coerce_tags(&record, "csv"), vec!["rust", "sql"]);
        assert_eq!(coerce_tags(&record, "json"), vec!["a", "b"]);
        assert!(coerce_tags(&record, "missing").is_empty());
    }

    #[test]
    fn bools() {
        let mut record = RawRecord::new();
        record.insert("a", json!(true));
        record.insert("b", "FALSE");
        record.insert("c", "True");
        assert!(coerce_bool(&record, "a"));
        assert!(!coerce_bool(&record, "b"));
        assert!(coerce_bool(&record, "c"));
    }
}
