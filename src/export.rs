//! Export engines.
//!
//! Both exporters share one paging loop: fetch a page of rows in storage
//! order, encode it, hand the bytes to the sink, repeat until a short page.
//!
//! - [`stream_export`]: synchronous; writes straight to an open sink and
//!   keeps no state beyond the loop. Backs `bulk export` and `GET /exports`.
//! - [`Exporter`]: filtered exports tracked as jobs, written to a file under
//!   `[export].output_dir` by a supervised background task.
//!
//! Pages are ordered by `rowid` with `LIMIT/OFFSET`. Upserts keep a row's
//! rowid, so only concurrent deletes can shift a page boundary.

use std::collections::BTreeMap;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::error::{BulkError, JobError};
use crate::jobs::{self, ExportJob, JobHandle, NewExportJob};
use crate::models::{Format, ResourceKind};
use crate::normalize;
use crate::resource::{self, Article, Comment, FilterValue, Resource, User};

// ============ encoding ============

/// Encodes rows page by page. The CSV header goes out with the first page,
/// even when that page is empty.
#[derive(Debug)]
pub struct PageEncoder {
    format: Format,
    fields: Vec<String>,
    header_written: bool,
}

impl PageEncoder {
    pub fn new(format: Format, fields: Vec<String>) -> Self {
        Self {
            format,
            fields,
            header_written: false,
        }
    }

    pub fn encode<R: Resource>(&mut self, rows: &[R]) -> io::Result<Vec<u8>> {
        match self.format {
            Format::Csv => self.encode_csv(rows),
            Format::Ndjson => self.encode_ndjson(rows),
        }
    }

    fn encode_csv<R: Resource>(&mut self, rows: &[R]) -> io::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        if !self.header_written {
            writer.write_record(&self.fields)?;
            self.header_written = true;
        }
        for row in rows {
            writer.write_record(self.fields.iter().map(|f| csv_cell(&row.field(f))))?;
        }
        writer.into_inner().map_err(|e| e.into_error())
    }

    fn encode_ndjson<R: Resource>(&mut self, rows: &[R]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        for row in rows {
            let object: Map<String, Value> = self
                .fields
                .iter()
                .map(|f| (f.clone(), row.field(f)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            serde_json::to_writer(&mut buf, &object)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// Flat text form of a field for CSV output.
fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

// ============ paging ============

/// Offset pager over one table with optional equality filters.
struct PageCursor<R> {
    filters: Vec<(&'static str, FilterValue)>,
    page_size: usize,
    offset: usize,
    exhausted: bool,
    _resource: PhantomData<R>,
}

impl<R: Resource> PageCursor<R> {
    fn new(filters: Vec<(&'static str, FilterValue)>, page_size: usize) -> Self {
        Self {
            filters,
            page_size: page_size.max(1),
            offset: 0,
            exhausted: false,
            _resource: PhantomData,
        }
    }

    /// The next page, or `None` once a short page has been returned.
    async fn next_page(&mut self, pool: &SqlitePool) -> Result<Option<Vec<R>>, sqlx::Error> {
        if self.exhausted {
            return Ok(None);
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            R::COLUMNS.join(", "),
            R::TABLE
        ));
        for (column, value) in &self.filters {
            query.push(format!(" AND {} = ", column));
            match value {
                FilterValue::Text(text) => query.push_bind(text.clone()),
                FilterValue::Bool(flag) => query.push_bind(*flag),
            };
        }
        query.push(" ORDER BY rowid LIMIT ");
        query.push_bind(self.page_size as i64);
        query.push(" OFFSET ");
        query.push_bind(self.offset as i64);

        let rows = query.build().fetch_all(pool).await?;
        let page = rows.iter().map(R::from_row).collect::<Result<Vec<_>, _>>()?;

        self.offset += page.len();
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        Ok(Some(page))
    }
}

/// One encoded page.
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub rows: u64,
}

struct Pager<R> {
    cursor: PageCursor<R>,
    encoder: PageEncoder,
}

impl<R: Resource> Pager<R> {
    async fn next_chunk(&mut self, pool: &SqlitePool) -> Result<Option<Chunk>, JobError> {
        let Some(page) = self
            .cursor
            .next_page(pool)
            .await
            .map_err(JobError::ExportRead)?
        else {
            return Ok(None);
        };
        let bytes = self.encoder.encode(&page).map_err(JobError::Output)?;
        Ok(Some(Chunk {
            bytes,
            rows: page.len() as u64,
        }))
    }
}

/// Paging loop for a resource kind chosen at runtime.
pub struct Pages(PagesInner);

enum PagesInner {
    Users(Pager<User>),
    Articles(Pager<Article>),
    Comments(Pager<Comment>),
}

impl Pages {
    pub fn new(
        kind: ResourceKind,
        format: Format,
        fields: Vec<String>,
        filters: Vec<(&'static str, FilterValue)>,
        page_size: usize,
    ) -> Self {
        fn pager<R: Resource>(
            format: Format,
            fields: Vec<String>,
            filters: Vec<(&'static str, FilterValue)>,
            page_size: usize,
        ) -> Pager<R> {
            Pager {
                cursor: PageCursor::new(filters, page_size),
                encoder: PageEncoder::new(format, fields),
            }
        }

        Pages(match kind {
            ResourceKind::Users => PagesInner::Users(pager(format, fields, filters, page_size)),
            ResourceKind::Articles => {
                PagesInner::Articles(pager(format, fields, filters, page_size))
            }
            ResourceKind::Comments => {
                PagesInner::Comments(pager(format, fields, filters, page_size))
            }
        })
    }

    pub async fn next_chunk(&mut self, pool: &SqlitePool) -> Result<Option<Chunk>, JobError> {
        match &mut self.0 {
            PagesInner::Users(p) => p.next_chunk(pool).await,
            PagesInner::Articles(p) => p.next_chunk(pool).await,
            PagesInner::Comments(p) => p.next_chunk(pool).await,
        }
    }
}

// ============ streaming export ============

/// Writes every row of `kind` to `out`, one page at a time, flushing after
/// each page. Returns the number of rows written.
pub async fn stream_export<W>(
    ctx: &Context,
    kind: ResourceKind,
    format: Format,
    out: &mut W,
) -> Result<u64, JobError>
where
    W: AsyncWrite + Unpin,
{
    let fields = resource::fields_of(kind)
        .iter()
        .map(|f| f.to_string())
        .collect();
    let mut pages = Pages::new(kind, format, fields, Vec::new(), ctx.config.export.page_size);

    let mut total = 0u64;
    while let Some(chunk) = pages.next_chunk(&ctx.pool).await? {
        out.write_all(&chunk.bytes).await.map_err(JobError::Output)?;
        out.flush().await.map_err(JobError::Output)?;
        total += chunk.rows;
    }

    tracing::debug!(resource = %kind, %format, total, "streaming export finished");
    Ok(total)
}

// ============ filtered export jobs ============

/// A request for a filtered export job.
#[derive(Debug, Clone)]
pub struct CreateExport {
    pub idempotency_key: String,
    pub resource: ResourceKind,
    pub format: Format,
    /// Equality filters keyed by column name.
    pub filters: BTreeMap<String, String>,
    /// Fields to include; empty means all of them.
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Exporter {
    ctx: Context,
}

impl Exporter {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Creates (or replays) an export job and starts its background task.
    pub async fn create_job(&self, req: CreateExport) -> Result<JobHandle<ExportJob>, BulkError> {
        let key = req.idempotency_key.trim().to_string();
        if key.is_empty() {
            return Err(BulkError::InvalidRequest(
                "idempotency key is required".to_string(),
            ));
        }

        if let Some(job) = self.ctx.jobs.find_export_by_key(&key).await? {
            tracing::info!(job_id = %job.id, key = %key, "export job replayed");
            return Ok(JobHandle {
                job,
                created: false,
                task: None,
            });
        }

        for (name, value) in &req.filters {
            resource::parse_filter(req.resource, name, value).map_err(BulkError::InvalidRequest)?;
        }
        let fields =
            resource::select_fields(req.resource, &req.fields).map_err(BulkError::InvalidRequest)?;

        let (job, created) = self
            .ctx
            .jobs
            .create_export(&NewExportJob {
                idempotency_key: key,
                resource_type: req.resource,
                format: req.format,
                filters: req.filters,
                fields,
            })
            .await?;

        if !created {
            return Ok(JobHandle {
                job,
                created: false,
                task: None,
            });
        }

        tracing::info!(
            job_id = %job.id,
            resource = %job.resource_type,
            format = %job.format,
            filters = ?job.filters,
            "export job created"
        );

        let task = self.spawn(job.clone());
        Ok(JobHandle {
            job,
            created: true,
            task: Some(task),
        })
    }

    fn spawn(&self, job: ExportJob) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let tracker = self.ctx.jobs.clone();
        let job_id = job.id.clone();
        let id = job.id.clone();

        jobs::supervise(job_id, run_export(ctx, job), move |message| async move {
            tracker.fail_export(&id, &message).await
        })
    }
}

async fn run_export(ctx: Context, job: ExportJob) -> Result<(), JobError> {
    ctx.jobs.start_export(&job.id).await?;

    let mut filters = Vec::with_capacity(job.filters.len());
    for (name, value) in &job.filters {
        // Validated at creation; a failure here means the stored row was edited.
        let filter = resource::parse_filter(job.resource_type, name, value)
            .map_err(|msg| JobError::Bookkeeping(anyhow::anyhow!(msg)))?;
        filters.push(filter);
    }

    let output_dir = &ctx.config.export.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(JobError::Output)?;
    let path = output_dir.join(export_file_name(&job));

    match write_export(&ctx, &job, filters, &path).await {
        Ok(total) => {
            let download_url = format!("/exports/{}/download", job.id);
            ctx.jobs
                .complete_export(&job.id, total, &path.to_string_lossy(), &download_url)
                .await
        }
        Err(err) => {
            if let Err(rm_err) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %rm_err, "no partial export to remove");
            }
            Err(err)
        }
    }
}

async fn write_export(
    ctx: &Context,
    job: &ExportJob,
    filters: Vec<(&'static str, FilterValue)>,
    path: &Path,
) -> Result<u64, JobError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(JobError::Output)?;
    let mut out = BufWriter::new(file);

    let mut pages = Pages::new(
        job.resource_type,
        job.format,
        job.fields.clone(),
        filters,
        ctx.config.export.page_size,
    );

    let mut total = 0u64;
    while let Some(chunk) = pages.next_chunk(&ctx.pool).await? {
        out.write_all(&chunk.bytes).await.map_err(JobError::Output)?;
        total += chunk.rows;
        ctx.jobs.record_export_progress(&job.id, total).await?;
    }
    out.flush().await.map_err(JobError::Output)?;

    Ok(total)
}

/// `{resource}_{id prefix}_{YYYYmmdd_HHMMSS}.{ext}`
fn export_file_name(job: &ExportJob) -> String {
    let prefix: String = job.id.chars().take(8).collect();
    format!(
        "{}_{}_{}.{}",
        job.resource_type,
        prefix,
        normalize::now().format("%Y%m%d_%H%M%S"),
        job.format.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn article(slug: &str, tags: &[&str], published: bool) -> Article {
        let created = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Article {
            id: format!("id-{}", slug),
            slug: slug.to_string(),
            title: "Title, with comma".to_string(),
            body: "Body".to_string(),
            author_id: "u1".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            status: if published { "published" } else { "draft" }.to_string(),
            published_at: published.then_some(created),
            created_at: created,
        }
    }

    fn all_fields() -> Vec<String> {
        Article::FIELDS.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn csv_header_once_and_flat_cells() {
        let mut encoder = PageEncoder::new(Format::Csv, all_fields());
        let first = encoder
            .encode(&[article("a-one", &["x", "y"], false)])
            .unwrap();
        let second = encoder.encode(&[article("a-two", &[], true)]).unwrap();

        let first = String::from_utf8(first).unwrap();
        let mut lines = first.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,slug,title,body,author_id,tags,status,published_at,created_at"
        );
        assert_eq!(
            lines.next().unwrap(),
            "id-a-one,a-one,\"Title, with comma\",Body,u1,\"x,y\",draft,,2024-05-01T12:00:00Z"
        );

        let second = String::from_utf8(second).unwrap();
        assert!(second.starts_with("id-a-two,"));
        assert!(second.contains(",published,2024-05-01T12:00:00Z,"));
    }

    #[test]
    fn empty_first_page_still_gets_header() {
        let mut encoder = PageEncoder::new(Format::Csv, vec!["id".into(), "slug".into()]);
        let bytes = encoder.encode::<Article>(&[]).unwrap();
        assert_eq!(bytes, b"id,slug\n");
    }

    #[test]
    fn ndjson_omits_absent_values_and_keeps_arrays() {
        let mut encoder = PageEncoder::new(Format::Ndjson, all_fields());
        let bytes = encoder.encode(&[article("a-one", &["x"], false)]).unwrap();
        let line = String::from_utf8(bytes).unwrap();
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["tags"], serde_json::json!(["x"]));
        assert!(value.get("published_at").is_none());
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn field_selection_applies() {
        let mut encoder =
            PageEncoder::new(Format::Ndjson, vec!["slug".to_string(), "status".to_string()]);
        let bytes = encoder.encode(&[article("a-one", &[], true)]).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"slug": "a-one", "status": "published"})
        );
    }

    #[test]
    fn file_name_shape() {
        let job = ExportJob {
            id: "0123456789abcdef".to_string(),
            idempotency_key: "k".to_string(),
            resource_type: ResourceKind::Users,
            format: Format::Ndjson,
            filters: BTreeMap::new(),
            fields: Vec::new(),
            status: jobs::JobStatus::Pending,
            total_records: 0,
            file_path: None,
            download_url: None,
            error: None,
            created_at: normalize::now(),
            updated_at: normalize::now(),
            completed_at: None,
        };
        let name = export_file_name(&job);
        assert!(name.starts_with("users_01234567_"));
        assert!(name.ends_with(".ndjson"));
        assert_eq!(name.len(), "users_01234567_20240101_000000.ndjson".len());
    }
}
