// src/models/change.rs

//! Classified changes and the per-run change report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DetectionMethod, SitemapInfo};

/// Kind of change detected for a URL.
///
/// Variant order fixes the sort order of report files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NewPage,
    ModifiedContent,
    DeletedPage,
    IgnoredFile,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::NewPage => "new_page",
            ChangeKind::ModifiedContent => "modified_content",
            ChangeKind::DeletedPage => "deleted_page",
            ChangeKind::IgnoredFile => "ignored_file",
        }
    }
}

/// One classified change, as emitted into the change report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub url: String,

    #[serde(rename = "change_type")]
    pub kind: ChangeKind,

    pub detected_at: DateTime<Utc>,

    /// Hash held by the baseline before this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,

    /// Hash observed in this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,

    /// File type for ignored (non-textual) URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ChangeRecord {
    pub fn new(url: impl Into<String>, kind: ChangeKind, detected_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            kind,
            detected_at,
            previous_hash: None,
            new_hash: None,
            file_type: None,
            detail: None,
        }
    }

    pub fn with_previous_hash(mut self, hash: impl Into<String>) -> Self {
        self.previous_hash = Some(hash.into());
        self
    }

    pub fn with_new_hash(mut self, hash: impl Into<String>) -> Self {
        self.new_hash = Some(hash.into());
        self
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Counts of each change kind for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSummary {
    pub new: usize,
    pub modified: usize,
    pub deleted: usize,
    pub ignored: usize,
    pub unchanged: usize,
}

impl ChangeSummary {
    /// Tally records, with the unchanged count supplied by the classifier.
    pub fn from_records(records: &[ChangeRecord], unchanged: usize) -> Self {
        let mut summary = Self {
            unchanged,
            ..Self::default()
        };
        for record in records {
            match record.kind {
                ChangeKind::NewPage => summary.new += 1,
                ChangeKind::ModifiedContent => summary.modified += 1,
                ChangeKind::DeletedPage => summary.deleted += 1,
                ChangeKind::IgnoredFile => summary.ignored += 1,
            }
        }
        summary
    }

    /// Total changes that affect the baseline (ignored files do not).
    pub fn total_changes(&self) -> usize {
        self.new + self.modified + self.deleted
    }
}

/// Provenance attached to a change report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMetadata {
    pub total_urls: usize,
    pub total_fingerprints: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap: Option<SitemapInfo>,
}

/// The per-run artifact listing classified changes.
///
/// Written as `<site>_<timestamp>.json` inside the run directory; it never
/// replaces the baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeReport {
    pub site: String,
    pub detected_at: DateTime<Utc>,
    pub method: DetectionMethod,
    pub changes: Vec<ChangeRecord>,
    pub summary: ChangeSummary,
    pub source_metadata: SourceMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let now = Utc::now();
        let records = vec![
            ChangeRecord::new("https://example.com/a", ChangeKind::NewPage, now),
            ChangeRecord::new("https://example.com/b", ChangeKind::NewPage, now),
            ChangeRecord::new("https://example.com/c", ChangeKind::ModifiedContent, now),
            ChangeRecord::new("https://example.com/d", ChangeKind::DeletedPage, now),
            ChangeRecord::new("https://example.com/e.pdf", ChangeKind::IgnoredFile, now),
        ];
        let summary = ChangeSummary::from_records(&records, 7);
        assert_eq!(summary.new, 2);
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.unchanged, 7);
        assert_eq!(summary.total_changes(), 4);
    }

    #[test]
    fn test_kind_sort_order() {
        let mut kinds = vec![
            ChangeKind::IgnoredFile,
            ChangeKind::DeletedPage,
            ChangeKind::NewPage,
            ChangeKind::ModifiedContent,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::NewPage,
                ChangeKind::ModifiedContent,
                ChangeKind::DeletedPage,
                ChangeKind::IgnoredFile,
            ]
        );
    }
}
