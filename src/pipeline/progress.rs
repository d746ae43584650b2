// src/pipeline/progress.rs

//! Run progress tracking.
//!
//! A `ProgressBoard` holds the latest stage per site and is shared between
//! running detections and the status endpoint. It is constructed by whoever
//! owns the process (CLI or server), never module-level.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::DetectionMethod;

/// Stage of a detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    ResolvingSitemap,
    Fingerprinting,
    Classifying,
    Evolving,
    WritingReports,
    Complete,
    Failed,
}

/// Latest progress for one site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteProgress {
    pub site_id: String,
    pub method: DetectionMethod,
    pub stage: RunStage,
    pub batches_done: usize,
    pub batches_total: usize,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide progress snapshot, keyed by site.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    inner: RwLock<BTreeMap<String, SiteProgress>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a run for a site.
    pub fn begin(&self, site_id: &str, method: DetectionMethod) {
        let mut board = self.inner.write().expect("progress lock poisoned");
        board.insert(
            site_id.to_string(),
            SiteProgress {
                site_id: site_id.to_string(),
                method,
                stage: RunStage::ResolvingSitemap,
                batches_done: 0,
                batches_total: 0,
                updated_at: Utc::now(),
            },
        );
    }

    /// Advance the stage of a tracked run.
    pub fn stage(&self, site_id: &str, stage: RunStage) {
        let mut board = self.inner.write().expect("progress lock poisoned");
        if let Some(progress) = board.get_mut(site_id) {
            progress.stage = stage;
            progress.updated_at = Utc::now();
        }
    }

    /// Record fingerprint batch progress.
    pub fn batches(&self, site_id: &str, done: usize, total: usize) {
        let mut board = self.inner.write().expect("progress lock poisoned");
        if let Some(progress) = board.get_mut(site_id) {
            progress.batches_done = done;
            progress.batches_total = total;
            progress.updated_at = Utc::now();
        }
    }

    /// Copy of the current state of every tracked site.
    pub fn snapshot(&self) -> Vec<SiteProgress> {
        let board = self.inner.read().expect("progress lock poisoned");
        board.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lifecycle() {
        let board = ProgressBoard::new();
        board.begin("example", DetectionMethod::Hybrid);
        board.stage("example", RunStage::Fingerprinting);
        board.batches("example", 3, 10);

        let snapshot = board.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].stage, RunStage::Fingerprinting);
        assert_eq!(snapshot[0].batches_done, 3);
        assert_eq!(snapshot[0].batches_total, 10);
    }

    #[test]
    fn test_stage_on_unknown_site_is_noop() {
        let board = ProgressBoard::new();
        board.stage("ghost", RunStage::Complete);
        assert!(board.snapshot().is_empty());
    }
}
