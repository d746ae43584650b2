// src/storage/mod.rs

//! Storage layer: baseline history, event logs, and run reports.
//!
//! ## Layout
//!
//! ```text
//! {baseline_root}/
//! └── {site-id}/
//!     ├── run.lock                              # per-site run exclusivity
//!     ├── store.lock                            # short-lived read/write lock
//!     ├── events.jsonl                          # append-only event log
//!     └── baseline_YYYYMMDD_HHMMSS_xxxxxxxx.json
//!
//! {output_root}/
//! └── {YYYYMMDD_HHMMSS}/                        # one directory per run
//!     ├── {site}_{timestamp}.json               # change report
//!     └── {site}_state_{method}_{timestamp}.json
//! ```
//!
//! All document writes go through write-temp → fsync → rename, so a reader
//! never observes a half-written file.

pub mod baselines;
pub mod reports;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

pub use baselines::{BaselineStore, SiteLock, ValidationReport};
pub use reports::ReportWriter;

use crate::error::Result;

/// Timestamp slug used in file and directory names.
pub(crate) fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Write bytes atomically (write to temp, fsync, then rename).
pub(crate) async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Serialize a value as pretty JSON and write it atomically.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_atomic_write_creates_parents_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/file.json");

        write_bytes_atomic(&path, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");

        write_bytes_atomic(&path, b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_timestamp_slug_format() {
        let at = "2026-03-01T10:20:30Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(timestamp_slug(at), "20260301_102030");
    }
}
