//! Per-kind record handling.
//!
//! Every resource kind implements [`Resource`]: how a raw record is
//! validated and normalized, how the canonical entity maps onto its table,
//! and which fields it exposes for export and filtering. The import and
//! export engines are generic over this trait, and the functions at the
//! bottom of this module dispatch a runtime [`ResourceKind`] to them.

pub mod article;
pub mod comment;
pub mod user;

pub use article::Article;
pub use comment::Comment;
pub use user::User;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::Sqlite;

use crate::models::{RawRecord, ResourceKind, ValidationOutcome};
use crate::normalize::IdentityPolicy;

/// A typed equality filter operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Bool(bool),
}

pub trait Resource: Sized + Send + Sync + 'static {
    const KIND: ResourceKind;
    const TABLE: &'static str;

    /// Canonical field names, in export order.
    const FIELDS: &'static [&'static str];

    /// Storage columns in the order [`Resource::bind_values`] binds them.
    const COLUMNS: &'static [&'static str];

    /// Column the upsert resolves conflicts on.
    const CONFLICT_KEY: &'static str;

    /// Columns overwritten when the conflict key already exists.
    const UPDATE_COLUMNS: &'static [&'static str];

    /// Filterable columns for the export engine.
    const FILTERS: &'static [&'static str];

    const IDENTITY: IdentityPolicy;

    /// Checks a raw record. All rule violations are collected.
    fn validate(record: &RawRecord, row: u64) -> ValidationOutcome;

    /// Builds the canonical entity from a record that passed validation.
    fn normalize(record: &RawRecord, now: DateTime<Utc>) -> Self;

    fn id(&self) -> &str;

    /// Value of [`Resource::CONFLICT_KEY`] for this entity.
    fn natural_key(&self) -> &str;

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;

    /// Binds one value per entry of [`Resource::COLUMNS`].
    fn bind_values(&self, values: &mut Separated<'_, '_, Sqlite, &'static str>);

    /// Canonical value of an export field; `Null` for absent optionals.
    fn field(&self, name: &str) -> Value;

    /// Parses a raw filter operand for one of [`Resource::FILTERS`].
    fn parse_filter(key: &str, raw: &str) -> Result<FilterValue, String> {
        let _ = key;
        Ok(FilterValue::Text(raw.to_string()))
    }
}

/// Canonical export fields of a kind.
pub fn fields_of(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Users => User::FIELDS,
        ResourceKind::Articles => Article::FIELDS,
        ResourceKind::Comments => Comment::FIELDS,
    }
}

/// Validates a filter key/value pair against a kind's filterable columns
/// and returns the column it applies to.
pub fn parse_filter(
    kind: ResourceKind,
    key: &str,
    raw: &str,
) -> Result<(&'static str, FilterValue), String> {
    fn check<R: Resource>(key: &str, raw: &str) -> Result<(&'static str, FilterValue), String> {
        let Some(column) = R::FILTERS.iter().copied().find(|f| *f == key) else {
            return Err(format!(
                "unknown filter '{}' for {}: allowed filters are {}",
                key,
                R::KIND,
                R::FILTERS.join(", ")
            ));
        };
        Ok((column, R::parse_filter(column, raw)?))
    }

    match kind {
        ResourceKind::Users => check::<User>(key, raw),
        ResourceKind::Articles => check::<Article>(key, raw),
        ResourceKind::Comments => check::<Comment>(key, raw),
    }
}

/// Checks a field selection against a kind's canonical fields and returns it
/// in canonical order. An empty selection means every field.
pub fn select_fields(kind: ResourceKind, requested: &[String]) -> Result<Vec<String>, String> {
    let all = fields_of(kind);
    if let Some(unknown) = requested.iter().find(|f| !all.contains(&f.as_str())) {
        return Err(format!(
            "unknown field '{}' for {}: allowed fields are {}",
            unknown,
            kind,
            all.join(", ")
        ));
    }

    Ok(all
        .iter()
        .filter(|f| requested.is_empty() || requested.iter().any(|r| r == *f))
        .map(|f| f.to_string())
        .collect())
}

/// Formats an optional timestamp the way exports render it.
pub(crate) fn ts_value(ts: Option<DateTime<Utc>>) -> Value {
    match ts {
        Some(ts) => Value::String(crate::models::format_ts(ts)),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_fields_keeps_canonical_order() {
        let picked = select_fields(
            ResourceKind::Users,
            &["role".to_string(), "email".to_string()],
        )
        .unwrap();
        assert_eq!(picked, vec!["email", "role"]);
    }

    #[test]
    fn empty_selection_is_everything() {
        let picked = select_fields(ResourceKind::Comments, &[]).unwrap();
        assert_eq!(picked.len(), Comment::FIELDS.len());
    }

    #[test]
    fn unknown_field_and_filter_rejected() {
        assert!(select_fields(ResourceKind::Users, &["password".to_string()]).is_err());
        assert!(parse_filter(ResourceKind::Users, "email", "a@b.io").is_err());
        assert!(parse_filter(ResourceKind::Articles, "status", "draft").is_ok());
    }
}
