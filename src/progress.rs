//! Job progress reporting for the CLI.
//!
//! While `bulk import` or `bulk export-job` waits for its background task,
//! the job row is polled and each change is reported. Progress is emitted
//! on **stderr** so stdout remains parseable for scripts.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::jobs::{JobStatus, JobTracker};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A snapshot of a running job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobProgressEvent {
    Import {
        job_id: String,
        status: JobStatus,
        processed: u64,
        total: u64,
        failed: u64,
    },
    Export {
        job_id: String,
        status: JobStatus,
        written: u64,
    },
}

/// Reports job progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &JobProgressEvent);
}

/// Human-friendly progress: "import 3f2a…  processing  1,234 / 5,000 records (12 failed)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &JobProgressEvent) {
        let line = match event {
            JobProgressEvent::Import {
                job_id,
                status,
                processed,
                total,
                failed,
            } => format!(
                "import {}  {}  {} / {} records ({} failed)\n",
                short_id(job_id),
                status,
                format_number(*processed),
                format_number(*total),
                format_number(*failed)
            ),
            JobProgressEvent::Export {
                job_id,
                status,
                written,
            } => format!(
                "export {}  {}  {} records written\n",
                short_id(job_id),
                status,
                format_number(*written)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &JobProgressEvent) {
        let obj = match event {
            JobProgressEvent::Import {
                job_id,
                status,
                processed,
                total,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "job": "import",
                "job_id": job_id,
                "status": status,
                "processed": processed,
                "total": total,
                "failed": failed
            }),
            JobProgressEvent::Export {
                job_id,
                status,
                written,
            } => serde_json::json!({
                "event": "progress",
                "job": "export",
                "job_id": job_id,
                "status": status,
                "written": written
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &JobProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Waits for an import task, reporting each change of the job's counters.
pub async fn watch_import(
    jobs: &JobTracker,
    job_id: &str,
    task: Option<JoinHandle<()>>,
    reporter: &dyn ProgressReporter,
) {
    watch(task, reporter, move || async move {
        let job = jobs.get_import(job_id).await.ok().flatten()?;
        Some(JobProgressEvent::Import {
            job_id: job.id,
            status: job.status,
            processed: job.processed_count,
            total: job.total_records,
            failed: job.fail_count,
        })
    })
    .await
}

/// Waits for an export task, reporting each change of its row counter.
pub async fn watch_export(
    jobs: &JobTracker,
    job_id: &str,
    task: Option<JoinHandle<()>>,
    reporter: &dyn ProgressReporter,
) {
    watch(task, reporter, move || async move {
        let job = jobs.get_export(job_id).await.ok().flatten()?;
        Some(JobProgressEvent::Export {
            job_id: job.id,
            status: job.status,
            written: job.total_records,
        })
    })
    .await
}

async fn watch<F, Fut>(task: Option<JoinHandle<()>>, reporter: &dyn ProgressReporter, mut poll: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<JobProgressEvent>>,
{
    let Some(mut task) = task else {
        return;
    };

    let mut last: Option<JobProgressEvent> = None;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut task => break,
            _ = ticker.tick() => {
                if let Some(event) = poll().await {
                    if last.as_ref() != Some(&event) {
                        reporter.report(&event);
                        last = Some(event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("0123456789"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
