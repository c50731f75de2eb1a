use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use super::Resource;
use crate::models::{format_ts, ts_from_epoch, RawRecord, ResourceKind, ValidationOutcome};
use crate::normalize::{self, IdentityPolicy};
use crate::validate::{self, MAX_COMMENT_WORDS};

/// Sub-entity attached to an article. Has no natural key, so the source id
/// is both required and the conflict key.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: String,
    pub article_id: String,
    pub user_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Resource for Comment {
    const KIND: ResourceKind = ResourceKind::Comments;
    const TABLE: &'static str = "comments";
    const FIELDS: &'static [&'static str] = &["id", "article_id", "user_id", "body", "created_at"];
    const COLUMNS: &'static [&'static str] = Self::FIELDS;
    const CONFLICT_KEY: &'static str = "id";
    const UPDATE_COLUMNS: &'static [&'static str] = &["article_id", "user_id", "body"];
    const FILTERS: &'static [&'static str] = &["article_id", "user_id"];
    const IDENTITY: IdentityPolicy = IdentityPolicy::Require;

    fn validate(record: &RawRecord, row: u64) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new(row, record.id());

        validate::require(record, "article_id", &mut outcome);
        validate::require(record, "user_id", &mut outcome);

        let body = record.text("body");
        if validate::exceeds_word_limit(&body, MAX_COMMENT_WORDS) {
            outcome.add_error(
                "body",
                format!(
                    "body exceeds {} words (has {})",
                    MAX_COMMENT_WORDS,
                    validate::count_words(&body)
                ),
            );
        }

        outcome
    }

    fn normalize(record: &RawRecord, now: DateTime<Utc>) -> Self {
        Self {
            // Admission already guaranteed an id.
            id: normalize::id_or_generate(record),
            article_id: record.text("article_id"),
            user_id: record.text("user_id"),
            body: record.text("body"),
            created_at: normalize::timestamp_or(record, "created_at", now),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.id
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            article_id: row.try_get("article_id")?,
            user_id: row.try_get("user_id")?,
            body: row.try_get("body")?,
            created_at: ts_from_epoch(row.try_get("created_at")?),
        })
    }

    fn bind_values(&self, values: &mut Separated<'_, '_, Sqlite, &'static str>) {
        values
            .push_bind(self.id.clone())
            .push_bind(self.article_id.clone())
            .push_bind(self.user_id.clone())
            .push_bind(self.body.clone())
            .push_bind(self.created_at.timestamp());
    }

    fn field(&self, name: &str) -> Value {
        match name {
            "id" => Value::from(self.id.as_str()),
            "article_id" => Value::from(self.article_id.as_str()),
            "user_id" => Value::from(self.user_id.as_str()),
            "body" => Value::from(self.body.as_str()),
            "created_at" => Value::from(format_ts(self.created_at)),
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_required() {
        let record: RawRecord = vec![("id", "c1"), ("body", "nice")].into_iter().collect();
        let outcome = Comment::validate(&record, 2);
        assert!(outcome.has_error_on("article_id"));
        assert!(outcome.has_error_on("user_id"));
        assert_eq!(outcome.record_id.as_deref(), Some("c1"));
    }

    #[test]
    fn long_body_rejected() {
        let body = vec!["word"; MAX_COMMENT_WORDS + 1].join(" ");
        let record: RawRecord = vec![
            ("id", "c1"),
            ("article_id", "a1"),
            ("user_id", "u1"),
            ("body", body.as_str()),
        ]
        .into_iter()
        .collect();
        let outcome = Comment::validate(&record, 2);
        assert!(outcome.has_error_on("body"));
        assert!(outcome.errors[0].message.contains("501"));
    }

    #[test]
    fn missing_id_is_not_a_validator_concern() {
        let record: RawRecord = vec![("article_id", "a1"), ("user_id", "u1")]
            .into_iter()
            .collect();
        assert!(Comment::validate(&record, 2).valid);
    }
}
