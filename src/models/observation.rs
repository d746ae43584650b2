// src/models/observation.rs

//! The current observation: what a single detection run saw.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fingerprint of one fetched page.
///
/// An empty `hash` is the sentinel for a failed fetch or canonicalization;
/// the classifier treats it as missing evidence and never asserts a
/// modification from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentFingerprint {
    /// Hex-encoded SHA-256 of the canonical text; empty on failure
    pub hash: String,

    /// Length in bytes of the canonical text
    pub content_length: u64,

    /// HTTP status observed, when a response was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// When the fetch completed
    pub fetched_at: DateTime<Utc>,

    /// Leading slice of the canonical text, for reviewable reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl ContentFingerprint {
    /// Sentinel fingerprint for a URL that produced no usable content.
    pub fn missing(status: Option<u16>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            hash: String::new(),
            content_length: 0,
            status,
            fetched_at,
            preview: None,
        }
    }

    /// Whether this fingerprint carries no usable hash.
    pub fn is_missing(&self) -> bool {
        self.hash.is_empty()
    }
}

/// Shape of the resolved sitemap entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SitemapKind {
    Single,
    Index,
}

/// Outcome of fetching one child sitemap of an index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildSitemapStatus {
    Success {
        urls: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_modified: Option<String>,
    },
    Error {
        reason: String,
    },
}

/// One child sitemap referenced by a sitemap index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildSitemap {
    pub url: String,
    #[serde(flatten)]
    pub status: ChildSitemapStatus,
}

/// Structural metadata about the resolved sitemap(s).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SitemapInfo {
    /// Entry point that was actually used
    pub entry_url: String,

    pub kind: SitemapKind,

    /// Total deduplicated URLs across all sitemaps
    pub total_urls: usize,

    /// Per-child outcomes; empty for a single sitemap
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildSitemap>,

    pub fetched_at: DateTime<Utc>,
}

impl SitemapInfo {
    /// Number of children that yielded URLs.
    pub fn successful_children(&self) -> usize {
        self.children
            .iter()
            .filter(|c| matches!(c.status, ChildSitemapStatus::Success { .. }))
            .count()
    }
}

/// The URL set and fingerprints produced by a single detection run, before
/// comparison against the baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Observation {
    /// Sorted, deduplicated absolute URLs
    pub urls: Vec<String>,

    /// URL → fingerprint; only populated by content-bearing methods
    #[serde(default)]
    pub fingerprints: BTreeMap<String, ContentFingerprint>,

    /// URL → file type for non-textual pages skipped by the fingerprinter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ignored: BTreeMap<String, String>,

    /// Metadata from sitemap resolution, when a sitemap was used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap: Option<SitemapInfo>,

    pub captured_at: DateTime<Utc>,
}

impl Observation {
    /// Build an observation from an arbitrary URL collection, deduplicating
    /// and sorting for deterministic serialization.
    pub fn new(urls: impl IntoIterator<Item = String>, captured_at: DateTime<Utc>) -> Self {
        let set: std::collections::BTreeSet<String> = urls.into_iter().collect();
        Self {
            urls: set.into_iter().collect(),
            fingerprints: BTreeMap::new(),
            ignored: BTreeMap::new(),
            sitemap: None,
            captured_at,
        }
    }

    /// The non-sentinel hash recorded for a URL, if any.
    pub fn hash_of(&self, url: &str) -> Option<&str> {
        self.fingerprints
            .get(url)
            .filter(|f| !f.is_missing())
            .map(|f| f.hash.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_dedupes_and_sorts() {
        let obs = Observation::new(
            [
                "https://example.com/b".to_string(),
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string(),
            ],
            Utc::now(),
        );
        assert_eq!(
            obs.urls,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_fingerprint_has_no_hash() {
        let mut obs = Observation::new(["https://example.com/a".to_string()], Utc::now());
        obs.fingerprints.insert(
            "https://example.com/a".to_string(),
            ContentFingerprint::missing(Some(404), Utc::now()),
        );
        assert!(obs.hash_of("https://example.com/a").is_none());
    }
}
