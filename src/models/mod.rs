//! Domain models for the change-detection engine.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.
//!
//! ## Storage Schema
//!
//! - Baselines: `baselines/<site-id>/baseline_<timestamp>_<hash>.json`
//! - Event log: `baselines/<site-id>/events.jsonl` (one event per line)
//! - Reports: `output/<run-timestamp>/<site>_<timestamp>.json`

mod baseline;
mod change;
mod event;
mod observation;
mod site;

// Re-export all public types
pub use baseline::{Baseline, BaselineMetadata, EvolutionType, HashEntry, BASELINE_VERSION};
pub use change::{ChangeKind, ChangeRecord, ChangeReport, ChangeSummary, SourceMetadata};
pub use event::{BaselineEvent, BaselineEventKind};
pub use observation::{
    ChildSitemap, ChildSitemapStatus, ContentFingerprint, Observation, SitemapInfo, SitemapKind,
};
pub use site::{DetectionMethod, SiteConfig};
