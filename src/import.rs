//! Import pipeline orchestration.
//!
//! Coordinates one import job end to end:
//!
//! ```text
//! source ─▶ parser thread ─▶ validate ─▶ admit ─▶ normalize ─▶ batch ─▶ upsert
//!                                 │          │                              │
//!                                 └──────────┴──▶ job error list ◀── reconcile
//! ```
//!
//! The loop is single-threaded per job; the parser runs on the blocking pool
//! behind a bounded channel so a slow database applies back-pressure to
//! file reading. Counters and the error list are persisted every
//! `batch_size` observed records and once more at the end.

use std::io::BufReader;

use tokio::task::JoinHandle;

use crate::context::Context;
use crate::error::{BulkError, JobError};
use crate::jobs::{self, ImportCounters, ImportJob, JobHandle, NewImportJob};
use crate::models::{Format, ResourceKind, ValidationOutcome};
use crate::normalize;
use crate::parse::{self, ParsedRecord};
use crate::reconcile;
use crate::resource::{Article, Comment, Resource, User};
use crate::source::ImportSource;
use crate::upsert::{self, Staged};

/// A request to start an import.
#[derive(Debug, Clone)]
pub struct CreateImport {
    pub idempotency_key: String,
    pub resource: ResourceKind,
    /// Taken from the source's extension when absent.
    pub format: Option<Format>,
    pub source: ImportSource,
}

#[derive(Debug, Clone)]
pub struct Importer {
    ctx: Context,
}

impl Importer {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Creates (or replays) an import job and starts its background task.
    ///
    /// The idempotency key is checked before anything else happens. A
    /// replay returns the existing job untouched, with no task.
    pub async fn create_job(&self, req: CreateImport) -> Result<JobHandle<ImportJob>, BulkError> {
        let key = req.idempotency_key.trim().to_string();
        if key.is_empty() {
            req.source.discard().await;
            return Err(BulkError::InvalidRequest(
                "idempotency key is required".to_string(),
            ));
        }

        if let Some(job) = self.ctx.jobs.find_import_by_key(&key).await? {
            req.source.discard().await;
            tracing::info!(job_id = %job.id, key = %key, "import job replayed");
            return Ok(JobHandle {
                job,
                created: false,
                task: None,
            });
        }

        let format = match self.check_request(&req) {
            Ok(format) => format,
            Err(err) => {
                req.source.discard().await;
                return Err(err);
            }
        };

        let (job, created) = self
            .ctx
            .jobs
            .create_import(&NewImportJob {
                idempotency_key: key,
                resource_type: req.resource,
                format,
                source: req.source.describe(),
            })
            .await?;

        if !created {
            // Lost the race to a concurrent request with the same key.
            req.source.discard().await;
            return Ok(JobHandle {
                job,
                created: false,
                task: None,
            });
        }

        tracing::info!(
            job_id = %job.id,
            resource = %req.resource,
            format = %format,
            source = %job.source,
            "import job created"
        );

        let task = self.spawn(job.id.clone(), req.resource, format, req.source);
        Ok(JobHandle {
            job,
            created: true,
            task: Some(task),
        })
    }

    fn check_request(&self, req: &CreateImport) -> Result<Format, BulkError> {
        req.source.validate().map_err(BulkError::InvalidRequest)?;
        req.format
            .or_else(|| req.source.detect_format())
            .ok_or_else(|| {
                BulkError::InvalidRequest(format!(
                    "cannot detect format of '{}': pass csv or ndjson explicitly",
                    req.source.describe()
                ))
            })
    }

    fn spawn(
        &self,
        job_id: String,
        resource: ResourceKind,
        format: Format,
        source: ImportSource,
    ) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let id = job_id.clone();
        let work = async move {
            match resource {
                ResourceKind::Users => run::<User>(&ctx, &id, format, source).await,
                ResourceKind::Articles => run::<Article>(&ctx, &id, format, source).await,
                ResourceKind::Comments => run::<Comment>(&ctx, &id, format, source).await,
            }
        };

        let tracker = self.ctx.jobs.clone();
        let id = job_id.clone();
        jobs::supervise(job_id, work, move |message| async move {
            tracker.fail_import(&id, &message).await
        })
    }
}

async fn run<R: Resource>(
    ctx: &Context,
    job_id: &str,
    format: Format,
    source: ImportSource,
) -> Result<(), JobError> {
    ctx.jobs.start_import(job_id).await?;

    let mut pipeline = Pipeline::<R>::new(ctx, job_id);
    match pipeline.execute(format, &source).await {
        Ok(()) => pipeline.finish().await,
        Err(err) => {
            // Keep what was learned before the failure visible on the job.
            if let Err(write_err) = pipeline.checkpoint().await {
                tracing::warn!(job_id, error = %write_err, "could not save partial progress");
            }
            Err(err)
        }
    }
}

struct Pipeline<'a, R: Resource> {
    ctx: &'a Context,
    job_id: &'a str,
    counters: ImportCounters,
    errors: Vec<ValidationOutcome>,
    batch: Vec<Staged<R>>,
    since_checkpoint: usize,
}

impl<'a, R: Resource> Pipeline<'a, R> {
    fn new(ctx: &'a Context, job_id: &'a str) -> Self {
        Self {
            ctx,
            job_id,
            counters: ImportCounters::default(),
            errors: Vec::new(),
            batch: Vec::with_capacity(ctx.config.import.batch_size),
            since_checkpoint: 0,
        }
    }

    async fn execute(&mut self, format: Format, source: &ImportSource) -> Result<(), JobError> {
        let ctx = self.ctx;
        let import_cfg = &ctx.config.import;
        let local = source.materialize(self.job_id, &import_cfg.uploads_dir).await?;
        let file = std::fs::File::open(&local.path).map_err(|e| {
            JobError::SourceUnreadable(format!("cannot open {}: {}", local.path.display(), e))
        })?;

        tracing::info!(job_id = self.job_id, resource = %R::KIND, %format, "import started");

        let mut records = parse::spawn_parser(
            BufReader::new(file),
            format,
            import_cfg.max_line_bytes,
            import_cfg.channel_capacity,
        );

        while let Some(item) = records.recv().await {
            match item {
                Ok(parsed) => self.accept(parsed),
                Err(err) if err.is_fatal() => {
                    return Err(JobError::SourceUnreadable(err.to_string()));
                }
                Err(err) => {
                    tracing::warn!(job_id = self.job_id, error = %err, "skipping unparsable input");
                    continue;
                }
            }

            self.since_checkpoint += 1;
            if self.since_checkpoint >= import_cfg.batch_size {
                self.flush().await?;
                self.checkpoint().await?;
            }
        }

        self.flush().await?;
        Ok(())
    }

    /// Routes one parsed record to the batch or to the error list.
    fn accept(&mut self, parsed: ParsedRecord) {
        self.counters.total += 1;

        if let Some(mismatch) = parsed.column_mismatch {
            tracing::debug!(
                job_id = self.job_id,
                row = parsed.row,
                expected = mismatch.expected,
                found = mismatch.found,
                "column count mismatch"
            );
        }

        let outcome = R::validate(&parsed.record, parsed.row);
        if !outcome.valid {
            self.reject(outcome);
            return;
        }
        if let Err(outcome) = normalize::admit(&parsed.record, parsed.row, R::IDENTITY) {
            self.reject(outcome);
            return;
        }

        self.batch.push(Staged {
            row: parsed.row,
            entity: R::normalize(&parsed.record, normalize::now()),
        });
    }

    fn reject(&mut self, outcome: ValidationOutcome) {
        self.counters.processed += 1;
        self.counters.failed += 1;
        self.errors.push(outcome);
    }

    async fn flush(&mut self) -> Result<(), JobError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.batch);
        let (staged, collisions) = upsert::split_id_collisions(&self.ctx.pool, staged).await?;
        for outcome in collisions {
            self.reject(outcome);
        }

        let written = upsert::upsert_batch(&self.ctx.pool, self.job_id, &staged).await?;
        self.counters.processed += written;
        self.counters.succeeded += written;
        self.batch = staged;
        self.batch.clear();
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<(), JobError> {
        self.since_checkpoint = 0;
        self.ctx
            .jobs
            .record_import_progress(self.job_id, &self.counters, &self.errors)
            .await
    }

    /// Reconciles, then completes the job with its final tallies.
    async fn finish(mut self) -> Result<(), JobError> {
        let report = reconcile::reconcile(&self.ctx.pool, R::KIND, self.job_id).await?;

        let orphaned = report.outcomes.len() as u64;
        self.counters.succeeded = self.counters.succeeded.saturating_sub(orphaned);
        self.counters.failed += orphaned;
        self.errors.extend(report.outcomes);
        self.errors.sort_by_key(|outcome| outcome.row_number);

        self.ctx
            .jobs
            .complete_import(self.job_id, &self.counters, &self.errors)
            .await
    }
}
