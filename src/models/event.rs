// src/models/event.rs

//! Baseline lifecycle events, appended to each site's event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChangeSummary;

/// Kind of baseline transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineEventKind {
    /// Initial baseline written
    Created,
    /// Successor baseline committed after detected changes
    Updated,
    /// Revalidation requested and the baseline checked out clean
    Validated,
    /// An older baseline re-issued as latest
    RolledBack,
    /// Proposed successor failed validation; commit aborted
    ValidationFailed,
    /// Run deadline expired; nothing committed
    RunAborted,
}

/// One line of the per-site append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineEvent {
    pub event_id: String,
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: BaselineEventKind,

    /// Change counts applied by this transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<ChangeSummary>,

    /// Identifier of the baseline that was latest before the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_baseline: Option<String>,

    /// Identifier of the baseline that became latest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_baseline: Option<String>,

    /// Validation errors, for `validation_failed` events
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl BaselineEvent {
    pub fn new(
        site_id: impl Into<String>,
        kind: BaselineEventKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let site_id = site_id.into();
        let event_id = format!("{}_{}", site_id, timestamp.format("%Y%m%d%H%M%S%3f"));
        Self {
            event_id,
            site_id,
            timestamp,
            kind,
            counts: None,
            previous_baseline: None,
            new_baseline: None,
            errors: Vec::new(),
        }
    }

    pub fn with_counts(mut self, counts: ChangeSummary) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_previous_baseline(mut self, id: impl Into<String>) -> Self {
        self.previous_baseline = Some(id.into());
        self
    }

    pub fn with_new_baseline(mut self, id: impl Into<String>) -> Self {
        self.new_baseline = Some(id.into());
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_embeds_site_and_timestamp() {
        let ts = "2026-03-01T10:20:30.456Z".parse::<DateTime<Utc>>().unwrap();
        let event = BaselineEvent::new("example", BaselineEventKind::Created, ts);
        assert_eq!(event.event_id, "example_20260301102030456");
    }

    #[test]
    fn test_event_line_roundtrip() {
        let event = BaselineEvent::new("example", BaselineEventKind::Updated, Utc::now())
            .with_counts(ChangeSummary {
                new: 1,
                modified: 2,
                deleted: 0,
                ignored: 0,
                unchanged: 10,
            })
            .with_new_baseline("baseline_20260301_102030_abcdef12.json");

        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        let back: BaselineEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.counts.unwrap().modified, 2);
    }
}
