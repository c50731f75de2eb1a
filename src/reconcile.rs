//! Orphan Reconciler.
//!
//! Runs once after every batch of an import has been committed. Rows whose
//! foreign keys do not resolve are deleted in a single statement per table;
//! rows the current job wrote come back as failed [`ValidationOutcome`]s so
//! the job can move them from succeeded to failed. Rows left dangling by
//! earlier jobs are swept too and only logged. Rows last written by another
//! job that is still pending or processing are left alone; that job sweeps
//! them when it reconciles.
//!
//! An article import also sweeps comments, since replacing or losing an
//! article can strand comments that pointed at it.

use sqlx::{FromRow, SqlitePool};

use crate::error::JobError;
use crate::models::{ResourceKind, ValidationOutcome};

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Deleted rows written by the reconciled job, one outcome each.
    pub outcomes: Vec<ValidationOutcome>,
    /// Deleted rows that belonged to other jobs (or predate provenance).
    pub foreign_deleted: u64,
}

#[derive(Debug, FromRow)]
struct OrphanArticle {
    id: String,
    author_id: String,
    import_job_id: Option<String>,
    import_row: Option<i64>,
}

#[derive(Debug, FromRow)]
struct OrphanComment {
    id: String,
    article_id: String,
    user_id: String,
    import_job_id: Option<String>,
    import_row: Option<i64>,
    missing_article: bool,
    missing_user: bool,
}

/// Sweeps the tables affected by an import of `kind`.
pub async fn reconcile(
    pool: &SqlitePool,
    kind: ResourceKind,
    job_id: &str,
) -> Result<ReconcileReport, JobError> {
    let mut report = ReconcileReport::default();

    match kind {
        // Users are never deleted, so a user import cannot orphan anything.
        ResourceKind::Users => {}
        ResourceKind::Articles => {
            sweep_articles(pool, job_id, &mut report).await?;
            sweep_comments(pool, job_id, &mut report).await?;
        }
        ResourceKind::Comments => {
            sweep_comments(pool, job_id, &mut report).await?;
        }
    }

    if report.foreign_deleted > 0 {
        tracing::warn!(
            job_id,
            deleted = report.foreign_deleted,
            "removed orphaned rows written by other jobs"
        );
    }
    if !report.outcomes.is_empty() {
        tracing::warn!(
            job_id,
            resource = %kind,
            deleted = report.outcomes.len(),
            "removed orphaned rows written by this job"
        );
    }

    Ok(report)
}

async fn sweep_articles(
    pool: &SqlitePool,
    job_id: &str,
    report: &mut ReconcileReport,
) -> Result<(), JobError> {
    let orphans: Vec<OrphanArticle> = sqlx::query_as(
        r#"
        DELETE FROM articles
        WHERE author_id NOT IN (SELECT id FROM users)
          AND (import_job_id IS NULL OR import_job_id = ?
               OR import_job_id NOT IN (SELECT id FROM import_jobs
                                        WHERE status IN ('pending', 'processing')))
        RETURNING id, author_id, import_job_id, import_row
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .map_err(JobError::Reconcile)?;

    for orphan in orphans {
        let Some(row) = own_row(job_id, &orphan.import_job_id, orphan.import_row) else {
            report.foreign_deleted += 1;
            continue;
        };
        let mut outcome = ValidationOutcome::new(row, Some(orphan.id));
        outcome.add_error(
            "author_id",
            format!("author_id '{}' does not reference an existing user", orphan.author_id),
        );
        report.outcomes.push(outcome);
    }

    Ok(())
}

async fn sweep_comments(
    pool: &SqlitePool,
    job_id: &str,
    report: &mut ReconcileReport,
) -> Result<(), JobError> {
    let orphans: Vec<OrphanComment> = sqlx::query_as(
        r#"
        DELETE FROM comments
        WHERE (article_id NOT IN (SELECT id FROM articles)
               OR user_id NOT IN (SELECT id FROM users))
          AND (import_job_id IS NULL OR import_job_id = ?
               OR import_job_id NOT IN (SELECT id FROM import_jobs
                                        WHERE status IN ('pending', 'processing')))
        RETURNING id, article_id, user_id, import_job_id, import_row,
            article_id NOT IN (SELECT id FROM articles) AS missing_article,
            user_id NOT IN (SELECT id FROM users) AS missing_user
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .map_err(JobError::Reconcile)?;

    for orphan in orphans {
        let Some(row) = own_row(job_id, &orphan.import_job_id, orphan.import_row) else {
            report.foreign_deleted += 1;
            continue;
        };
        let mut outcome = ValidationOutcome::new(row, Some(orphan.id));
        if orphan.missing_article {
            outcome.add_error(
                "article_id",
                format!(
                    "article_id '{}' does not reference an existing article",
                    orphan.article_id
                ),
            );
        }
        if orphan.missing_user {
            outcome.add_error(
                "user_id",
                format!("user_id '{}' does not reference an existing user", orphan.user_id),
            );
        }
        report.outcomes.push(outcome);
    }

    Ok(())
}

fn own_row(job_id: &str, writer: &Option<String>, row: Option<i64>) -> Option<u64> {
    match (writer.as_deref(), row) {
        (Some(writer), Some(row)) if writer == job_id => Some(row.max(0) as u64),
        _ => None,
    }
}
