// src/storage/reports.rs

//! Run-scoped output: change reports and state snapshots.
//!
//! Every trigger creates one timestamped run directory under the output
//! root; each site run writes its change report and a snapshot of the
//! observation there.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ChangeReport, DetectionMethod, Observation};
use crate::storage::{timestamp_slug, write_json_atomic};

/// Writer bound to one run directory.
pub struct ReportWriter {
    run_dir: PathBuf,
    run_timestamp: String,
}

impl ReportWriter {
    /// Create the run directory `output/<YYYYMMDD_HHMMSS>/`.
    pub async fn create(output_root: impl AsRef<Path>, now: DateTime<Utc>) -> Result<Self> {
        let run_timestamp = timestamp_slug(now);
        let run_dir = output_root.as_ref().join(&run_timestamp);
        tokio::fs::create_dir_all(&run_dir).await?;
        Ok(Self {
            run_dir,
            run_timestamp,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_timestamp(&self) -> &str {
        &self.run_timestamp
    }

    /// Write the change report as `<site>_<timestamp>.json`.
    pub async fn write_changes(&self, site_id: &str, report: &ChangeReport) -> Result<PathBuf> {
        let name = format!("{site_id}_{}.json", timestamp_slug(report.detected_at));
        let path = self.run_dir.join(name);
        write_json_atomic(&path, report).await?;
        Ok(path)
    }

    /// Write the observation snapshot as
    /// `<site>_state_<method>_<timestamp>.json`.
    pub async fn write_state(
        &self,
        site_id: &str,
        method: DetectionMethod,
        observation: &Observation,
    ) -> Result<PathBuf> {
        let name = format!(
            "{site_id}_state_{method}_{}.json",
            timestamp_slug(observation.captured_at)
        );
        let path = self.run_dir.join(name);
        write_json_atomic(&path, observation).await?;
        Ok(path)
    }

    /// The most recent change-report files for a site across all run
    /// directories, newest first.
    pub async fn list_change_files(
        output_root: impl AsRef<Path>,
        site_id: &str,
        limit: usize,
    ) -> Result<Vec<PathBuf>> {
        let mut run_dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(output_root.as_ref()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                run_dirs.push(entry.path());
            }
        }
        // Run directories are timestamp-named; newest first.
        run_dirs.sort_by(|a, b| b.cmp(a));

        let prefix = format!("{site_id}_");
        let state_marker = format!("{site_id}_state_");
        let mut files = Vec::new();

        for dir in run_dirs {
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(&prefix)
                    && !name.starts_with(&state_marker)
                    && name.ends_with(".json")
                {
                    names.push(name);
                }
            }
            names.sort_by(|a, b| b.cmp(a));
            for name in names {
                files.push(dir.join(name));
                if files.len() >= limit {
                    return Ok(files);
                }
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeSummary, SourceMetadata};
    use tempfile::TempDir;

    fn make_report(detected_at: DateTime<Utc>) -> ChangeReport {
        ChangeReport {
            site: "example".to_string(),
            detected_at,
            method: DetectionMethod::Sitemap,
            changes: Vec::new(),
            summary: ChangeSummary::default(),
            source_metadata: SourceMetadata {
                total_urls: 0,
                total_fingerprints: 0,
                sitemap: None,
            },
        }
    }

    #[tokio::test]
    async fn test_report_and_state_land_in_run_dir() {
        let tmp = TempDir::new().unwrap();
        let now = "2026-03-01T10:20:30Z".parse().unwrap();
        let writer = ReportWriter::create(tmp.path(), now).await.unwrap();

        let report_path = writer
            .write_changes("example", &make_report(now))
            .await
            .unwrap();
        let state_path = writer
            .write_state(
                "example",
                DetectionMethod::Sitemap,
                &Observation::new(Vec::new(), now),
            )
            .await
            .unwrap();

        assert!(report_path.starts_with(tmp.path().join("20260301_102030")));
        assert_eq!(
            report_path.file_name().unwrap().to_str().unwrap(),
            "example_20260301_102030.json"
        );
        assert_eq!(
            state_path.file_name().unwrap().to_str().unwrap(),
            "example_state_sitemap_20260301_102030.json"
        );
    }

    #[tokio::test]
    async fn test_list_change_files_newest_first_with_limit() {
        let tmp = TempDir::new().unwrap();

        for (day, hour) in [(1, 9), (2, 9), (3, 9)] {
            let at = format!("2026-03-0{day}T0{hour}:00:00Z").parse().unwrap();
            let writer = ReportWriter::create(tmp.path(), at).await.unwrap();
            writer.write_changes("example", &make_report(at)).await.unwrap();
            writer
                .write_state(
                    "example",
                    DetectionMethod::Sitemap,
                    &Observation::new(Vec::new(), at),
                )
                .await
                .unwrap();
        }

        let files = ReportWriter::list_change_files(tmp.path(), "example", 2)
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
        // State snapshots are excluded; newest run first.
        assert!(files[0].to_str().unwrap().contains("20260303"));
        assert!(files
            .iter()
            .all(|f| !f.to_str().unwrap().contains("_state_")));
    }

    #[tokio::test]
    async fn test_list_change_files_missing_root() {
        let tmp = TempDir::new().unwrap();
        let files =
            ReportWriter::list_change_files(tmp.path().join("nope"), "example", 5)
                .await
                .unwrap();
        assert!(files.is_empty());
    }
}
