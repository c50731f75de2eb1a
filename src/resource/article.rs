use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use super::{ts_value, FilterValue, Resource};
use crate::models::{format_ts, ts_from_epoch, RawRecord, ResourceKind, ValidationOutcome};
use crate::normalize::{self, IdentityPolicy};
use crate::validate;

pub const STATUSES: &[&str] = &["draft", "published"];

/// Content entity, keyed on its slug.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub body: String,
    pub author_id: String,
    pub tags: Vec<String>,
    pub status: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Resource for Article {
    const KIND: ResourceKind = ResourceKind::Articles;
    const TABLE: &'static str = "articles";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "slug",
        "title",
        "body",
        "author_id",
        "tags",
        "status",
        "published_at",
        "created_at",
    ];
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "slug",
        "title",
        "body",
        "author_id",
        "tags_json",
        "status",
        "published_at",
        "created_at",
    ];
    const CONFLICT_KEY: &'static str = "slug";
    const UPDATE_COLUMNS: &'static [&'static str] = &[
        "title",
        "body",
        "author_id",
        "tags_json",
        "status",
        "published_at",
    ];
    const FILTERS: &'static [&'static str] = &["status", "author_id"];
    const IDENTITY: IdentityPolicy = IdentityPolicy::Generate;

    fn validate(record: &RawRecord, row: u64) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new(row, record.id());

        if validate::require(record, "slug", &mut outcome)
            && !validate::is_kebab_slug(&record.text("slug"))
        {
            outcome.add_error(
                "slug",
                "slug must be lowercase words separated by single hyphens",
            );
        }

        validate::require(record, "author_id", &mut outcome);

        let status = record.text("status");
        if validate::require(record, "status", &mut outcome) && !STATUSES.contains(&status.as_str())
        {
            outcome.add_error("status", "status must be draft or published");
        }

        if status == "draft" && !record.is_blank("published_at") {
            outcome.add_error("published_at", "draft articles must not have published_at");
        }

        match record.get("tags") {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            // CSV carries tags comma-joined, so a comma inside one tag cannot survive export.
            Some(Value::Array(items)) if items.iter().all(is_plain_tag) => {}
            Some(Value::Array(_)) => {
                outcome.add_error("tags", "each tag must be a plain value without commas")
            }
            Some(_) => outcome.add_error("tags", "tags must be an array or a comma-separated string"),
        }

        outcome
    }

    fn normalize(record: &RawRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: normalize::id_or_generate(record),
            slug: record.text("slug"),
            title: record.text("title"),
            body: record.text("body"),
            author_id: record.text("author_id"),
            tags: normalize::coerce_tags(record, "tags"),
            status: record.text("status"),
            published_at: normalize::optional_timestamp(record, "published_at", now),
            created_at: normalize::timestamp_or(record, "created_at", now),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.slug
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let tags_json: String = row.try_get("tags_json")?;
        let tags = serde_json::from_str(&tags_json).map_err(|e| sqlx::Error::ColumnDecode {
            index: "tags_json".to_string(),
            source: Box::new(e),
        })?;
        let published_at: Option<i64> = row.try_get("published_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            author_id: row.try_get("author_id")?,
            tags,
            status: row.try_get("status")?,
            published_at: published_at.map(ts_from_epoch),
            created_at: ts_from_epoch(row.try_get("created_at")?),
        })
    }

    fn bind_values(&self, values: &mut Separated<'_, '_, Sqlite, &'static str>) {
        let tags_json = serde_json::to_string(&self.tags).unwrap_or_else(|_| "[]".to_string());
        values
            .push_bind(self.id.clone())
            .push_bind(self.slug.clone())
            .push_bind(self.title.clone())
            .push_bind(self.body.clone())
            .push_bind(self.author_id.clone())
            .push_bind(tags_json)
            .push_bind(self.status.clone())
            .push_bind(self.published_at.map(|ts| ts.timestamp()))
            .push_bind(self.created_at.timestamp());
    }

    fn field(&self, name: &str) -> Value {
        match name {
            "id" => Value::from(self.id.as_str()),
            "slug" => Value::from(self.slug.as_str()),
            "title" => Value::from(self.title.as_str()),
            "body" => Value::from(self.body.as_str()),
            "author_id" => Value::from(self.author_id.as_str()),
            "tags" => Value::from(self.tags.clone()),
            "status" => Value::from(self.status.as_str()),
            "published_at" => ts_value(self.published_at),
            "created_at" => Value::from(format_ts(self.created_at)),
            _ => Value::Null,
        }
    }

    fn parse_filter(key: &str, raw: &str) -> Result<FilterValue, String> {
        if key == "status" && !STATUSES.contains(&raw) {
            return Err("filter 'status' must be draft or published".to_string());
        }
        Ok(FilterValue::Text(raw.to_string()))
    }
}

fn is_plain_tag(item: &Value) -> bool {
    match item {
        Value::String(tag) => !tag.contains(','),
        Value::Number(_) | Value::Bool(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> RawRecord {
        vec![
            ("slug", "hello-world"),
            ("title", "Hello"),
            ("author_id", "u1"),
            ("status", "published"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn valid_record_passes() {
        assert!(Article::validate(&valid(), 2).valid);
    }

    #[test]
    fn draft_with_published_at_always_rejected() {
        let mut record = valid();
        record.insert("status", "draft");
        record.insert("published_at", "2024-01-01T00:00:00Z");
        let outcome = Article::validate(&record, 3);
        assert!(!outcome.valid);
        assert!(outcome.has_error_on("published_at"));
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn slug_and_status_rules() {
        let mut record = valid();
        record.insert("slug", "Hello World");
        record.insert("status", "archived");
        record.insert("author_id", "");
        let outcome = Article::validate(&record, 2);
        assert!(outcome.has_error_on("slug"));
        assert!(outcome.has_error_on("status"));
        assert!(outcome.has_error_on("author_id"));
    }

    #[test]
    fn tags_must_be_list_or_string() {
        let mut record = valid();
        record.insert("tags", json!({"a": 1}));
        assert!(Article::validate(&record, 2).has_error_on("tags"));

        record.insert("tags", json!(["a", "b"]));
        assert!(Article::validate(&record, 2).valid);
    }

    #[test]
    fn tag_with_comma_rejected() {
        let mut record = valid();
        record.insert("tags", json!(["rust", "c, d"]));
        assert!(Article::validate(&record, 2).has_error_on("tags"));

        record.insert("tags", json!(["rust", ["nested"]]));
        assert!(Article::validate(&record, 2).has_error_on("tags"));

        record.insert("tags", json!(["rust", 2024]));
        assert!(Article::validate(&record, 2).valid);
    }

    #[test]
    fn normalize_published_at() {
        let now = normalize::now();
        let mut record = valid();
        let article = Article::normalize(&record, now);
        assert_eq!(article.published_at, None);

        record.insert("published_at", "not a date");
        let article = Article::normalize(&record, now);
        assert_eq!(article.published_at, Some(now));
    }

    #[test]
    fn export_fields() {
        let mut record = valid();
        record.insert("tags", "rust,sql");
        let article = Article::normalize(&record, normalize::now());
        assert_eq!(article.field("tags"), json!(["rust", "sql"]));
        assert_eq!(article.field("published_at"), Value::Null);
    }
}
