use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use super::{FilterValue, Resource};
use crate::models::{format_ts, ts_from_epoch, RawRecord, ResourceKind, ValidationOutcome};
use crate::normalize::{self, IdentityPolicy};
use crate::validate;

/// Principal entity, keyed on its lower-cased email.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource for User {
    const KIND: ResourceKind = ResourceKind::Users;
    const TABLE: &'static str = "users";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "email",
        "name",
        "role",
        "active",
        "created_at",
        "updated_at",
    ];
    const COLUMNS: &'static [&'static str] = Self::FIELDS;
    const CONFLICT_KEY: &'static str = "email";
    const UPDATE_COLUMNS: &'static [&'static str] = &["name", "role", "active", "updated_at"];
    const FILTERS: &'static [&'static str] = &["role", "active"];
    const IDENTITY: IdentityPolicy = IdentityPolicy::Generate;

    fn validate(record: &RawRecord, row: u64) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new(row, record.id());

        if validate::require(record, "email", &mut outcome)
            && !validate::is_valid_email(&record.text("email"))
        {
            outcome.add_error("email", "email must look like local@domain.tld");
        }

        validate::require(record, "role", &mut outcome);

        if validate::require(record, "active", &mut outcome)
            && validate::parse_bool_literal(&record.text("active")).is_none()
        {
            outcome.add_error("active", "active must be true or false");
        }

        outcome
    }

    fn normalize(record: &RawRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: normalize::id_or_generate(record),
            email: record.text("email").to_lowercase(),
            name: record.text("name"),
            role: record.text("role"),
            active: normalize::coerce_bool(record, "active"),
            created_at: normalize::timestamp_or(record, "created_at", now),
            updated_at: normalize::timestamp_or(record, "updated_at", now),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.email
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            role: row.try_get("role")?,
            active: row.try_get("active")?,
            created_at: ts_from_epoch(row.try_get("created_at")?),
            updated_at: ts_from_epoch(row.try_get("updated_at")?),
        })
    }

    fn bind_values(&self, values: &mut Separated<'_, '_, Sqlite, &'static str>) {
        values
            .push_bind(self.id.clone())
            .push_bind(self.email.clone())
            .push_bind(self.name.clone())
            .push_bind(self.role.clone())
            .push_bind(self.active)
            .push_bind(self.created_at.timestamp())
            .push_bind(self.updated_at.timestamp());
    }

    fn field(&self, name: &str) -> Value {
        match name {
            "id" => Value::from(self.id.as_str()),
            "email" => Value::from(self.email.as_str()),
            "name" => Value::from(self.name.as_str()),
            "role" => Value::from(self.role.as_str()),
            "active" => Value::Bool(self.active),
            "created_at" => Value::from(format_ts(self.created_at)),
            "updated_at" => Value::from(format_ts(self.updated_at)),
            _ => Value::Null,
        }
    }

    fn parse_filter(key: &str, raw: &str) -> Result<FilterValue, String> {
        match key {
            "active" => validate::parse_bool_literal(raw.trim())
                .map(FilterValue::Bool)
                .ok_or_else(|| "filter 'active' must be true or false".to_string()),
            _ => Ok(FilterValue::Text(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn collects_every_violation() {
        let outcome = User::validate(
            &record(&[("email", "nope"), ("role", ""), ("active", "yes")]),
            5,
        );
        assert!(!outcome.valid);
        assert!(outcome.has_error_on("email"));
        assert!(outcome.has_error_on("role"));
        assert!(outcome.has_error_on("active"));
        assert_eq!(outcome.row_number, 5);
    }

    #[test]
    fn active_has_no_default() {
        let outcome = User::validate(&record(&[("email", "a@b.io"), ("role", "admin")]), 2);
        assert!(outcome.has_error_on("active"));
    }

    #[test]
    fn normalize_lowercases_email_and_generates_id() {
        let now = normalize::now();
        let user = User::normalize(
            &record(&[
                ("email", "Alice@Example.COM"),
                ("role", "admin"),
                ("active", "TRUE"),
            ]),
            now,
        );
        assert_eq!(user.email, "alice@example.com");
        assert!(user.active);
        assert!(!user.id.is_empty());
        assert_eq!(user.created_at, now);
    }

    #[test]
    fn filter_active_is_typed() {
        assert_eq!(
            User::parse_filter("active", "False"),
            Ok(FilterValue::Bool(false))
        );
        assert!(User::parse_filter("active", "maybe").is_err());
    }
}
