//! Import sources.
//!
//! A job reads from a caller-owned local file, from an upload the HTTP
//! layer already streamed to disk, or from a remote URL the background task
//! downloads before parsing. Uploaded and downloaded copies live under
//! `[import].uploads_dir` and are removed once the job is done with them.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::JobError;
use crate::models::Format;
use crate::normalize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    /// Caller-owned file. Never deleted.
    Path(PathBuf),
    /// Staged upload, owned by the job that claims it.
    Upload { path: PathBuf, file_name: String },
    /// Remote `http(s)` location fetched by the job.
    Url(String),
}

impl ImportSource {
    /// What the job row records as its source location.
    pub fn describe(&self) -> String {
        match self {
            ImportSource::Path(path) => path.display().to_string(),
            ImportSource::Upload { file_name, .. } => format!("upload:{}", file_name),
            ImportSource::Url(url) => url.clone(),
        }
    }

    /// Format implied by the file name or URL path.
    pub fn detect_format(&self) -> Option<Format> {
        match self {
            ImportSource::Path(path) => Format::from_path(&path.to_string_lossy()),
            ImportSource::Upload { file_name, .. } => Format::from_path(file_name),
            ImportSource::Url(url) => Format::from_path(url),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ImportSource::Url(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(format!("file_url must be an http(s) URL, got '{}'", url))
            }
            _ => Ok(()),
        }
    }

    /// Removes a staged upload. Used when the idempotency key turned out to
    /// belong to an existing job and the upload will never be read.
    pub async fn discard(&self) {
        if let ImportSource::Upload { path, .. } = self {
            if let Err(err) = tokio::fs::remove_file(path).await {
                tracing::debug!(path = %path.display(), error = %err, "could not remove staged upload");
            }
        }
    }

    /// Makes the source readable as a local file, downloading it if needed.
    pub async fn materialize(
        &self,
        job_id: &str,
        uploads_dir: &Path,
    ) -> Result<LocalSource, JobError> {
        match self {
            ImportSource::Path(path) => {
                if !path.is_file() {
                    return Err(JobError::SourceUnreadable(format!(
                        "{} is not a readable file",
                        path.display()
                    )));
                }
                Ok(LocalSource {
                    path: path.clone(),
                    owned: false,
                })
            }
            ImportSource::Upload { path, .. } => Ok(LocalSource {
                path: path.clone(),
                owned: true,
            }),
            ImportSource::Url(url) => {
                let target = uploads_dir.join(format!("download-{}", job_id));
                download(url, &target).await?;
                Ok(LocalSource {
                    path: target,
                    owned: true,
                })
            }
        }
    }
}

/// A source on local disk, removed on drop when the job owns it.
#[derive(Debug)]
pub struct LocalSource {
    pub path: PathBuf,
    owned: bool,
}

impl Drop for LocalSource {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A fresh path under `uploads_dir` for an incoming upload.
pub fn staged_upload_path(uploads_dir: &Path, file_name: &str) -> PathBuf {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("dat");
    uploads_dir.join(format!("upload-{}.{}", normalize::generate_id(), ext))
}

async fn download(url: &str, target: &Path) -> Result<(), JobError> {
    let unreadable = |msg: String| JobError::SourceUnreadable(msg);

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| unreadable(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let mut response = reqwest::get(url)
        .await
        .map_err(|e| unreadable(format!("download {} failed: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(unreadable(format!(
            "download {} failed: HTTP {}",
            url,
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|e| unreadable(format!("cannot create {}: {}", target.display(), e)))?;

    let mut downloaded = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| unreadable(format!("download {} interrupted: {}", url, e)))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| unreadable(format!("cannot write {}: {}", target.display(), e)))?;
        downloaded += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| unreadable(format!("cannot write {}: {}", target.display(), e)))?;

    tracing::debug!(url, bytes = downloaded, "source downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_from_each_kind() {
        assert_eq!(
            ImportSource::Path(PathBuf::from("/tmp/users.csv")).detect_format(),
            Some(Format::Csv)
        );
        let upload = ImportSource::Upload {
            path: PathBuf::from("/tmp/upload-1.dat"),
            file_name: "comments.ndjson".to_string(),
        };
        assert_eq!(upload.detect_format(), Some(Format::Ndjson));
        assert_eq!(upload.describe(), "upload:comments.ndjson");
    }

    #[test]
    fn only_http_urls() {
        assert!(ImportSource::Url("ftp://x/y.csv".into()).validate().is_err());
        assert!(ImportSource::Url("https://x/y.csv".into()).validate().is_ok());
    }

    #[tokio::test]
    async fn missing_path_is_unreadable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = ImportSource::Path(tmp.path().join("nope.csv"));
        let err = source.materialize("job", tmp.path()).await.unwrap_err();
        assert!(matches!(err, JobError::SourceUnreadable(_)));
    }

    #[test]
    fn staged_paths_are_unique() {
        let dir = Path::new("/tmp/uploads");
        let a = staged_upload_path(dir, "users.csv");
        let b = staged_upload_path(dir, "users.csv");
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "csv");
    }
}
