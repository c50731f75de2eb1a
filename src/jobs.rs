//! Job Tracker.
//!
//! Persists import and export jobs and moves them through
//! `pending → processing → completed | failed`. Every transition is a
//! conditional `UPDATE`, so a job that already reached a terminal state can
//! never be moved again, whatever order concurrent writers arrive in.
//!
//! Idempotency is enforced by the `UNIQUE(idempotency_key)` constraint:
//! creation is `INSERT ... ON CONFLICT DO NOTHING` followed by a lookup, so
//! two racing requests with the same key observe the same row and only one
//! of them is told it created it.
//!
//! Background work runs under [`supervise`], which guarantees the job is
//! finalized as failed when the work returns an error or panics.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;

use crate::error::{BulkError, JobError};
use crate::models::{ts_from_epoch, Format, ResourceKind, ValidationOutcome};
use crate::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Import counters. `succeeded + failed == total` once a job completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounters {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportJob {
    pub id: String,
    pub idempotency_key: String,
    pub resource_type: ResourceKind,
    pub format: Format,
    pub source: String,
    pub status: JobStatus,
    pub total_records: u64,
    pub processed_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn counters(&self) -> ImportCounters {
        ImportCounters {
            total: self.total_records,
            processed: self.processed_count,
            succeeded: self.success_count,
            failed: self.fail_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportJob {
    pub id: String,
    pub idempotency_key: String,
    pub resource_type: ResourceKind,
    pub format: Format,
    pub filters: BTreeMap<String, String>,
    pub fields: Vec<String>,
    pub status: JobStatus,
    pub total_records: u64,
    pub file_path: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields fixed at import creation.
#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub idempotency_key: String,
    pub resource_type: ResourceKind,
    pub format: Format,
    pub source: String,
}

/// Fields fixed at export creation.
#[derive(Debug, Clone)]
pub struct NewExportJob {
    pub idempotency_key: String,
    pub resource_type: ResourceKind,
    pub format: Format,
    pub filters: BTreeMap<String, String>,
    pub fields: Vec<String>,
}

/// A job as returned to a creating caller.
#[derive(Debug)]
pub struct JobHandle<J> {
    pub job: J,
    /// False when the key matched an existing job.
    pub created: bool,
    /// The background task, present only when this call started one.
    pub task: Option<JoinHandle<()>>,
}

impl<J> JobHandle<J> {
    /// Waits for the background task, if any.
    pub async fn wait(self) -> J {
        if let Some(task) = self.task {
            // The supervisor never panics; a join error here means the
            // runtime is shutting down.
            let _ = task.await;
        }
        self.job
    }
}

#[derive(Debug, Clone)]
pub struct JobTracker {
    pool: SqlitePool,
}

impl JobTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============ import jobs ============

    pub async fn find_import_by_key(&self, key: &str) -> Result<Option<ImportJob>, BulkError> {
        let row = sqlx::query("SELECT * FROM import_jobs WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(import_from_row).transpose()
    }

    pub async fn get_import(&self, id: &str) -> Result<Option<ImportJob>, BulkError> {
        let row = sqlx::query("SELECT * FROM import_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(import_from_row).transpose()
    }

    /// Inserts a pending import job unless the key is taken. Returns the
    /// job owning the key and whether this call created it.
    pub async fn create_import(&self, new: &NewImportJob) -> Result<(ImportJob, bool), BulkError> {
        let now = normalize::now().timestamp();
        let inserted = sqlx::query(
            r#"
            INSERT INTO import_jobs (id, idempotency_key, resource_type, format, source, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(normalize::generate_id())
        .bind(&new.idempotency_key)
        .bind(new.resource_type.as_str())
        .bind(new.format.as_str())
        .bind(&new.source)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let job = self
            .find_import_by_key(&new.idempotency_key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("import job vanished after insert"))?;
        Ok((job, inserted))
    }

    pub async fn start_import(&self, id: &str) -> Result<bool, JobError> {
        self.transition(
            "UPDATE import_jobs SET status = 'processing', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
            id,
        )
        .await
    }

    /// Writes counters and the error list accumulated so far.
    pub async fn record_import_progress(
        &self,
        id: &str,
        counters: &ImportCounters,
        errors: &[ValidationOutcome],
    ) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET total_records = ?, processed_count = ?, success_count = ?, fail_count = ?,
                errors_json = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(counters.total as i64)
        .bind(counters.processed as i64)
        .bind(counters.succeeded as i64)
        .bind(counters.failed as i64)
        .bind(errors_json(errors)?)
        .bind(normalize::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(bookkeeping)?;
        Ok(())
    }

    pub async fn complete_import(
        &self,
        id: &str,
        counters: &ImportCounters,
        errors: &[ValidationOutcome],
    ) -> Result<(), JobError> {
        let now = normalize::now().timestamp();
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'completed', total_records = ?, processed_count = ?, success_count = ?,
                fail_count = ?, errors_json = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(counters.total as i64)
        .bind(counters.processed as i64)
        .bind(counters.succeeded as i64)
        .bind(counters.failed as i64)
        .bind(errors_json(errors)?)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(bookkeeping)?;

        tracing::info!(
            job_id = id,
            total = counters.total,
            succeeded = counters.succeeded,
            failed = counters.failed,
            "import job completed"
        );
        Ok(())
    }

    /// Marks a non-terminal import failed and appends one synthetic error
    /// entry carrying `message`.
    pub async fn fail_import(&self, id: &str, message: &str) -> Result<(), JobError> {
        let entry = serde_json::to_string(&ValidationOutcome::fatal(message))
            .map_err(|e| JobError::Bookkeeping(e.into()))?;
        let now = normalize::now().timestamp();
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'failed', errors_json = json_insert(errors_json, '$[#]', json(?)),
                updated_at = ?, completed_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(entry)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(bookkeeping)?;

        tracing::info!(job_id = id, "import job failed");
        Ok(())
    }

    // ============ export jobs ============

    pub async fn find_export_by_key(&self, key: &str) -> Result<Option<ExportJob>, BulkError> {
        let row = sqlx::query("SELECT * FROM export_jobs WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(export_from_row).transpose()
    }

    pub async fn get_export(&self, id: &str) -> Result<Option<ExportJob>, BulkError> {
        let row = sqlx::query("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(export_from_row).transpose()
    }

    pub async fn create_export(&self, new: &NewExportJob) -> Result<(ExportJob, bool), BulkError> {
        let now = normalize::now().timestamp();
        let filters_json = serde_json::to_string(&new.filters).map_err(anyhow::Error::from)?;
        let fields_json = serde_json::to_string(&new.fields).map_err(anyhow::Error::from)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO export_jobs (id, idempotency_key, resource_type, format, filters_json, fields_json, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(normalize::generate_id())
        .bind(&new.idempotency_key)
        .bind(new.resource_type.as_str())
        .bind(new.format.as_str())
        .bind(filters_json)
        .bind(fields_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let job = self
            .find_export_by_key(&new.idempotency_key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("export job vanished after insert"))?;
        Ok((job, inserted))
    }

    pub async fn start_export(&self, id: &str) -> Result<bool, JobError> {
        self.transition(
            "UPDATE export_jobs SET status = 'processing', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
            id,
        )
        .await
    }

    pub async fn record_export_progress(&self, id: &str, total: u64) -> Result<(), JobError> {
        sqlx::query(
            "UPDATE export_jobs SET total_records = ?, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(total as i64)
        .bind(normalize::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(bookkeeping)?;
        Ok(())
    }

    pub async fn complete_export(
        &self,
        id: &str,
        total: u64,
        file_path: &str,
        download_url: &str,
    ) -> Result<(), JobError> {
        let now = normalize::now().timestamp();
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'completed', total_records = ?, file_path = ?, download_url = ?,
                updated_at = ?, completed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(total as i64)
        .bind(file_path)
        .bind(download_url)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(bookkeeping)?;

        tracing::info!(job_id = id, total, file_path, "export job completed");
        Ok(())
    }

    pub async fn fail_export(&self, id: &str, message: &str) -> Result<(), JobError> {
        let now = normalize::now().timestamp();
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'failed', error = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(bookkeeping)?;

        tracing::info!(job_id = id, "export job failed");
        Ok(())
    }

    // ============ store overview ============

    /// Job counts per status, for `bulk stats`.
    pub async fn count_by_status(&self, table: JobTable) -> Result<Vec<(String, i64)>, BulkError> {
        let sql = format!(
            "SELECT status, COUNT(*) AS n FROM {} GROUP BY status ORDER BY status",
            table.as_str()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }

    async fn transition(&self, sql: &str, id: &str) -> Result<bool, JobError> {
        let moved = sqlx::query(sql)
            .bind(normalize::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(bookkeeping)?
            .rows_affected()
            == 1;
        if moved {
            tracing::info!(job_id = id, "job processing");
        }
        Ok(moved)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum JobTable {
    Imports,
    Exports,
}

impl JobTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTable::Imports => "import_jobs",
            JobTable::Exports => "export_jobs",
        }
    }
}

/// Runs `work` as an independent background task.
///
/// `work` finalizes its own success. If it returns an error, panics, or is
/// cancelled, `on_failure` runs with the failure message; the full error
/// chain is logged but never handed to `on_failure`.
pub fn supervise<W, F, FFut>(job_id: String, work: W, on_failure: F) -> JoinHandle<()>
where
    W: Future<Output = Result<(), JobError>> + Send + 'static,
    F: FnOnce(String) -> FFut + Send + 'static,
    FFut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match tokio::spawn(work).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(JobError::Panicked),
            Err(_) => Err(JobError::Cancelled),
        };

        let Err(err) = result else {
            return;
        };

        let message = err.to_string();
        tracing::error!(job_id = %job_id, error = %format!("{:#}", anyhow::Error::new(err)), "job failed");

        if let Err(finalize_err) = on_failure(message).await {
            tracing::error!(
                job_id = %job_id,
                error = %format!("{:#}", anyhow::Error::new(finalize_err)),
                "could not mark job failed"
            );
        }
    })
}

fn bookkeeping(err: sqlx::Error) -> JobError {
    JobError::Bookkeeping(err.into())
}

fn errors_json(errors: &[ValidationOutcome]) -> Result<String, JobError> {
    serde_json::to_string(errors).map_err(|e| JobError::Bookkeeping(e.into()))
}

fn parse_column<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> anyhow::Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("bad {} column", column))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> anyhow::Result<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("bad {} column", column))
}

fn import_from_row(row: &SqliteRow) -> Result<ImportJob, BulkError> {
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    Ok(ImportJob {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        resource_type: parse_column(row, "resource_type")?,
        format: parse_column(row, "format")?,
        source: row.try_get("source")?,
        status: parse_column(row, "status")?,
        total_records: row.try_get::<i64, _>("total_records")?.max(0) as u64,
        processed_count: row.try_get::<i64, _>("processed_count")?.max(0) as u64,
        success_count: row.try_get::<i64, _>("success_count")?.max(0) as u64,
        fail_count: row.try_get::<i64, _>("fail_count")?.max(0) as u64,
        errors: json_column(row, "errors_json")?,
        created_at: ts_from_epoch(row.try_get("created_at")?),
        updated_at: ts_from_epoch(row.try_get("updated_at")?),
        completed_at: completed_at.map(ts_from_epoch),
    })
}

fn export_from_row(row: &SqliteRow) -> Result<ExportJob, BulkError> {
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    Ok(ExportJob {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        resource_type: parse_column(row, "resource_type")?,
        format: parse_column(row, "format")?,
        filters: json_column(row, "filters_json")?,
        fields: json_column(row, "fields_json")?,
        status: parse_column(row, "status")?,
        total_records: row.try_get::<i64, _>("total_records")?.max(0) as u64,
        file_path: row.try_get("file_path")?,
        download_url: row.try_get("download_url")?,
        error: row.try_get("error")?,
        created_at: ts_from_epoch(row.try_get("created_at")?),
        updated_at: ts_from_epoch(row.try_get("updated_at")?),
        completed_at: completed_at.map(ts_from_epoch),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn tracker() -> (TempDir, JobTracker) {
        let tmp = TempDir::new().unwrap();
        let config = Config::in_dir(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, JobTracker::new(pool))
    }

    fn new_import(key: &str) -> NewImportJob {
        NewImportJob {
            idempotency_key: key.to_string(),
            resource_type: ResourceKind::Users,
            format: Format::Csv,
            source: "users.csv".to_string(),
        }
    }

    #[tokio::test]
    async fn same_key_returns_same_job() {
        let (_tmp, tracker) = tracker().await;
        let (first, created) = tracker.create_import(&new_import("k1")).await.unwrap();
        assert!(created);
        assert_eq!(first.status, JobStatus::Pending);

        let (second, created) = tracker.create_import(&new_import("k1")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let (_tmp, tracker) = tracker().await;
        let (job, _) = tracker.create_import(&new_import("k2")).await.unwrap();

        assert!(tracker.start_import(&job.id).await.unwrap());
        assert!(!tracker.start_import(&job.id).await.unwrap());

        let counters = ImportCounters {
            total: 2,
            processed: 2,
            succeeded: 2,
            failed: 0,
        };
        tracker.complete_import(&job.id, &counters, &[]).await.unwrap();
        tracker.fail_import(&job.id, "late failure").await.unwrap();

        let job = tracker.get_import(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.errors.is_empty());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_appends_synthetic_entry() {
        let (_tmp, tracker) = tracker().await;
        let (job, _) = tracker.create_import(&new_import("k3")).await.unwrap();
        tracker.start_import(&job.id).await.unwrap();

        let mut earlier = ValidationOutcome::new(2, None);
        earlier.add_error("email", "email is required");
        let counters = ImportCounters {
            total: 1,
            processed: 1,
            succeeded: 0,
            failed: 1,
        };
        tracker
            .record_import_progress(&job.id, &counters, &[earlier])
            .await
            .unwrap();
        tracker.fail_import(&job.id, "source unreadable: gone").await.unwrap();

        let job = tracker.get_import(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 2);
        assert_eq!(job.errors[1].row_number, 0);
        assert_eq!(job.errors[1].errors[0].message, "source unreadable: gone");
        assert_eq!(job.fail_count, 1);
    }

    #[tokio::test]
    async fn supervisor_finalizes_panicking_work() {
        let (_tmp, tracker) = tracker().await;
        let (job, _) = tracker.create_import(&new_import("k4")).await.unwrap();

        let fail_tracker = tracker.clone();
        let job_id = job.id.clone();
        let handle = supervise(
            job.id.clone(),
            async move {
                if job_id.is_empty() {
                    return Ok(());
                }
                panic!("boom");
            },
            move |message| async move { fail_tracker.fail_import(&job.id, &message).await },
        );
        handle.await.unwrap();

        let (job, _) = tracker.create_import(&new_import("k4")).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors[0].errors[0].message, "job worker panicked");
    }
}
