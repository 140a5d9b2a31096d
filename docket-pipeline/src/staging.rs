//! Staging storage for uploaded item payloads
//!
//! Each job owns `<staging_root>/<job_id>/`. Files stay there while the job
//! is pending and are removed when it completes or its submission is rolled back.

use docket_common::config::LimitsConfig;
use docket_common::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum accepted job id length
pub const MAX_JOB_ID_LEN: usize = 100;

/// One uploaded file before validation
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A file rejected at validation, with the reason shown to the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub filename: String,
    pub reason: String,
}

/// A file written to staging and assigned an item id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedItem {
    pub item_id: String,
    pub display_name: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Item id for the `index`-th item of a job: `{first 8 chars of job id}_{index:03}`
pub fn item_id(job_id: &str, index: u64) -> String {
    let prefix: String = job_id.chars().take(8).collect();
    format!("{}_{:03}", prefix, index)
}

/// Inverse of [`item_id`] for the index part
pub fn parse_item_index(item_id: &str) -> Option<u64> {
    item_id.rsplit_once('_')?.1.parse().ok()
}

/// Job ids name staging directories, so they are restricted to a path-safe alphabet
pub fn validate_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() || job_id.len() > MAX_JOB_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "job_id must be 1..={} characters",
            MAX_JOB_ID_LEN
        )));
    }
    if !job_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(
            "job_id may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    limits: LimitsConfig,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>, limits: LimitsConfig) -> Self {
        Self {
            root: root.into(),
            limits,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.root.join(job_id))
    }

    /// Target text length check, in characters
    pub fn validate_target_text(&self, text: &str) -> Result<()> {
        let len = text.trim().chars().count();
        if len < self.limits.target_text_min_chars || len > self.limits.target_text_max_chars {
            return Err(Error::InvalidInput(format!(
                "target_text must be {}..={} characters, got {}",
                self.limits.target_text_min_chars, self.limits.target_text_max_chars, len
            )));
        }
        Ok(())
    }

    /// Why `upload` would be rejected, if it would
    pub fn check_upload(&self, upload: &Upload) -> Option<String> {
        let Some(name) = sanitize_filename(&upload.filename) else {
            return Some("invalid filename".to_string());
        };

        let extension = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()));
        match extension {
            Some(ext) if self.limits.allowed_extensions.iter().any(|a| a == &ext) => {}
            _ => {
                return Some(format!(
                    "unsupported file type (allowed: {})",
                    self.limits.allowed_extensions.join(", ")
                ))
            }
        }

        if upload.bytes.is_empty() {
            return Some("empty file".to_string());
        }
        if upload.bytes.len() as u64 > self.limits.max_file_bytes {
            return Some(format!(
                "file exceeds {} MB limit",
                self.limits.max_file_bytes / (1024 * 1024)
            ));
        }
        None
    }

    /// Split uploads into acceptable files and skipped ones
    pub fn partition(&self, uploads: Vec<Upload>) -> (Vec<Upload>, Vec<SkippedFile>) {
        let mut accepted = Vec::new();
        let mut skipped = Vec::new();
        for upload in uploads {
            match self.check_upload(&upload) {
                None => accepted.push(upload),
                Some(reason) => {
                    debug!(filename = %upload.filename, %reason, "Upload skipped");
                    skipped.push(SkippedFile {
                        filename: upload.filename,
                        reason,
                    });
                }
            }
        }
        (accepted, skipped)
    }

    /// Write `uploads` under the job directory, numbering items from `first_index`.
    ///
    /// Display names that collide with a file already on disk are stored as
    /// `name_1.ext`, `name_2.ext`, .... If any write fails, the files written
    /// by this call are removed before the error is returned.
    pub async fn stage(
        &self,
        job_id: &str,
        first_index: u64,
        uploads: Vec<Upload>,
    ) -> Result<Vec<StagedItem>> {
        let dir = self.job_dir(job_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let mut staged: Vec<StagedItem> = Vec::with_capacity(uploads.len());
        let mut taken: HashSet<PathBuf> = HashSet::new();

        for (offset, upload) in uploads.into_iter().enumerate() {
            let display_name = sanitize_filename(&upload.filename)
                .ok_or_else(|| Error::InvalidInput(format!("invalid filename {}", upload.filename)))?;
            let path = unique_path(&dir, &display_name, &taken).await;

            if let Err(e) = tokio::fs::write(&path, &upload.bytes).await {
                warn!(job_id, path = %path.display(), error = %e, "Staging write failed, rolling back batch");
                let paths: Vec<PathBuf> = staged.iter().map(|s| s.path.clone()).collect();
                self.remove_files(&paths).await;
                return Err(Error::Io(e));
            }

            taken.insert(path.clone());
            staged.push(StagedItem {
                item_id: item_id(job_id, first_index + offset as u64),
                display_name,
                path,
            });
        }

        info!(job_id, count = staged.len(), "Items staged");
        Ok(staged)
    }

    /// Best-effort removal of individual staged files
    pub async fn remove_files(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove staged file");
                }
            }
        }
    }

    /// Remove the job directory and everything in it. Missing is fine.
    pub async fn remove_job(&self, job_id: &str) -> Result<()> {
        let dir = self.job_dir(job_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(job_id, "Staging directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Final path component of a client-supplied name, or `None` if nothing usable remains
fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

async fn unique_path(dir: &Path, display_name: &str, taken: &HashSet<PathBuf>) -> PathBuf {
    let candidate = dir.join(display_name);
    if !taken.contains(&candidate) && !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let as_path = Path::new(display_name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(display_name);
    let ext = as_path.extension().and_then(|e| e.to_str());

    let mut counter = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        let candidate = dir.join(name);
        if !taken.contains(&candidate) && !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(root: &Path) -> StagingArea {
        StagingArea::new(root, LimitsConfig::default())
    }

    fn upload(name: &str, bytes: &[u8]) -> Upload {
        Upload {
            filename: name.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_item_id_format() {
        assert_eq!(item_id("3f2a9c1e-77b0-4e59", 0), "3f2a9c1e_000");
        assert_eq!(item_id("short", 12), "short_012");
        assert_eq!(item_id("3f2a9c1e-77b0-4e59", 1234), "3f2a9c1e_1234");
        assert_eq!(parse_item_index("3f2a9c1e_012"), Some(12));
        assert_eq!(parse_item_index("nounderscore"), None);
    }

    #[test]
    fn test_job_id_rejects_path_tricks() {
        assert!(validate_job_id("job-1_a").is_ok());
        assert!(validate_job_id("../etc").is_err());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_partition_reports_skip_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(
            dir.path(),
            LimitsConfig {
                max_file_bytes: 8,
                ..LimitsConfig::default()
            },
        );

        let (accepted, skipped) = area.partition(vec![
            upload("ok.txt", b"hello"),
            upload("big.pdf", b"0123456789"),
            upload("notes.exe", b"MZ"),
            upload("empty.md", b""),
        ]);

        assert_eq!(accepted.len(), 1);
        assert_eq!(skipped.len(), 3);
        assert!(skipped[0].reason.contains("exceeds"));
        assert!(skipped[1].reason.contains("unsupported"));
        assert_eq!(skipped[2].reason, "empty file");
    }

    #[test]
    fn test_target_text_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let area = staging(dir.path());
        assert!(area.validate_target_text("too short").is_err());
        assert!(area.validate_target_text(&"a".repeat(60)).is_ok());
        assert!(area.validate_target_text(&"a".repeat(10_001)).is_err());
    }

    #[tokio::test]
    async fn test_stage_dedups_names_and_numbers_items() {
        let dir = tempfile::tempdir().unwrap();
        let area = staging(dir.path());

        let first = area
            .stage("job-abcdef", 0, vec![upload("cv.txt", b"one"), upload("cv.txt", b"two")])
            .await
            .unwrap();
        let second = area
            .stage("job-abcdef", 2, vec![upload("nested/dir/cv.txt", b"three")])
            .await
            .unwrap();

        let ids: Vec<_> = first.iter().chain(&second).map(|s| s.item_id.as_str()).collect();
        assert_eq!(ids, vec!["job-abcd_000", "job-abcd_001", "job-abcd_002"]);

        let names: Vec<_> = first
            .iter()
            .chain(&second)
            .map(|s| s.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["cv.txt", "cv_1.txt", "cv_2.txt"]);
        assert_eq!(second[0].display_name, "cv.txt");
        assert_eq!(std::fs::read(&second[0].path).unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_remove_job_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let area = staging(dir.path());
        area.stage("job-1", 0, vec![upload("a.txt", b"x")]).await.unwrap();

        area.remove_job("job-1").await.unwrap();
        assert!(!dir.path().join("job-1").exists());
        area.remove_job("job-1").await.unwrap();
    }
}
