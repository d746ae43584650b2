// src/models/baseline.rs

//! Persisted baselines: the ground truth a run compares against.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangeSummary, ContentFingerprint, DetectionMethod, Observation, SitemapInfo};

/// Schema tag written into every baseline document.
pub const BASELINE_VERSION: &str = "2.0";

/// How a baseline came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionType {
    /// First baseline for the site, built directly from an observation
    Initial,
    /// Produced by merging the predecessor with a classified change set
    AutomaticUpdate,
    /// An older baseline re-issued as latest by operator request
    ManualRollback,
}

/// Content hash entry persisted per URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashEntry {
    /// Hex-encoded SHA-256 of the canonical text
    pub hash: String,
    /// Length in bytes of the canonical text
    pub length: u64,
}

impl From<&ContentFingerprint> for HashEntry {
    fn from(fp: &ContentFingerprint) -> Self {
        Self {
            hash: fp.hash.clone(),
            length: fp.content_length,
        }
    }
}

/// Free-form provenance carried by a baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaselineMetadata {
    /// Detection method that produced this baseline
    pub method: DetectionMethod,

    pub hash_algorithm: String,

    /// Sitemap structure observed when this baseline was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap: Option<SitemapInfo>,
}

/// A persisted snapshot of a site's known URLs and content fingerprints.
///
/// Baselines are immutable once written; evolution produces a successor
/// document instead of mutating in place. Keys serialize in lexicographic
/// order (sorted URL vector, BTreeMap hashes) so identical baselines are
/// byte-identical on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Baseline {
    pub site_id: String,
    pub site_name: String,

    pub created_at: DateTime<Utc>,

    /// Creation timestamp of the predecessor, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_created_at: Option<DateTime<Utc>>,

    pub baseline_version: String,

    pub evolution_type: EvolutionType,

    /// Sorted, deduplicated URL set
    pub urls: Vec<String>,

    /// URL → content hash; may be empty for sitemap-only baselines
    #[serde(default)]
    pub content_hashes: BTreeMap<String, HashEntry>,

    /// Counts relative to the predecessor (zero for initial baselines)
    #[serde(default)]
    pub change_summary: ChangeSummary,

    pub metadata: BaselineMetadata,
}

impl Baseline {
    /// Build the initial baseline for a site directly from an observation.
    pub fn from_observation(
        site_id: impl Into<String>,
        site_name: impl Into<String>,
        method: DetectionMethod,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Self {
        let urls: BTreeSet<String> = observation.urls.iter().cloned().collect();
        // Content-method baselines keep one entry per URL; pages without
        // usable evidence get the empty-hash sentinel so the URL set and the
        // hash key set stay equal.
        let content_hashes: BTreeMap<String, HashEntry> = if method.uses_content() {
            urls.iter()
                .map(|url| {
                    let entry = observation
                        .fingerprints
                        .get(url)
                        .filter(|fp| !fp.is_missing())
                        .map(HashEntry::from)
                        .unwrap_or(HashEntry {
                            hash: String::new(),
                            length: 0,
                        });
                    (url.clone(), entry)
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        Self {
            site_id: site_id.into(),
            site_name: site_name.into(),
            created_at: now,
            previous_created_at: None,
            baseline_version: BASELINE_VERSION.to_string(),
            evolution_type: EvolutionType::Initial,
            urls: urls.into_iter().collect(),
            content_hashes,
            change_summary: ChangeSummary::default(),
            metadata: BaselineMetadata {
                method,
                hash_algorithm: "sha256".to_string(),
                sitemap: observation.sitemap.clone(),
            },
        }
    }

    /// Whether this baseline was produced by a content-bearing method.
    pub fn has_content_method(&self) -> bool {
        self.metadata.method.uses_content()
    }

    /// The URL set as a borrowed ordered set.
    pub fn url_set(&self) -> BTreeSet<&str> {
        self.urls.iter().map(|u| u.as_str()).collect()
    }

    /// The hash recorded for a URL, if present and non-empty.
    pub fn hash_of(&self, url: &str) -> Option<&str> {
        self.content_hashes
            .get(url)
            .filter(|e| !e.hash.is_empty())
            .map(|e| e.hash.as_str())
    }

    /// Re-express this baseline as an observation, as if a run had seen
    /// exactly this state. Comparing a baseline against its own observation
    /// classifies no changes.
    pub fn as_observation(&self) -> Observation {
        let mut observation = Observation::new(self.urls.iter().cloned(), self.created_at);
        observation.fingerprints = self
            .content_hashes
            .iter()
            .map(|(url, entry)| {
                (
                    url.clone(),
                    ContentFingerprint {
                        hash: entry.hash.clone(),
                        content_length: entry.length,
                        status: None,
                        fetched_at: self.created_at,
                        preview: None,
                    },
                )
            })
            .collect();
        observation.sitemap = self.metadata.sitemap.clone();
        observation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_observation(entries: &[(&str, &str)]) -> Observation {
        let now = Utc::now();
        let mut obs = Observation::new(entries.iter().map(|(u, _)| u.to_string()), now);
        for (url, hash) in entries {
            obs.fingerprints.insert(
                url.to_string(),
                ContentFingerprint {
                    hash: hash.to_string(),
                    content_length: hash.len() as u64,
                    status: Some(200),
                    fetched_at: now,
                    preview: None,
                },
            );
        }
        obs
    }

    #[test]
    fn test_initial_baseline_from_observation() {
        let obs = make_observation(&[
            ("https://example.com/a", "h1"),
            ("https://example.com/b", "h2"),
        ]);
        let baseline = Baseline::from_observation(
            "example",
            "Example",
            DetectionMethod::Hybrid,
            &obs,
            Utc::now(),
        );

        assert_eq!(baseline.evolution_type, EvolutionType::Initial);
        assert_eq!(baseline.urls.len(), 2);
        assert_eq!(baseline.content_hashes.len(), 2);
        assert_eq!(baseline.hash_of("https://example.com/a"), Some("h1"));
        assert!(baseline.previous_created_at.is_none());
    }

    #[test]
    fn test_failed_fetches_become_sentinel_entries() {
        let now = Utc::now();
        let mut obs = make_observation(&[("https://example.com/a", "h1")]);
        obs.urls.push("https://example.com/broken".to_string());
        obs.urls.sort();
        obs.fingerprints.insert(
            "https://example.com/broken".to_string(),
            ContentFingerprint::missing(Some(500), now),
        );

        let baseline =
            Baseline::from_observation("example", "Example", DetectionMethod::Content, &obs, now);

        // URL set and hash key set stay equal; the broken page holds the
        // empty-hash sentinel and asserts nothing.
        assert_eq!(baseline.urls.len(), 2);
        assert_eq!(baseline.content_hashes.len(), 2);
        assert!(baseline.hash_of("https://example.com/broken").is_none());
        assert_eq!(
            baseline.content_hashes["https://example.com/broken"].length,
            0
        );
    }

    #[test]
    fn test_sitemap_baseline_has_no_hashes() {
        let obs = make_observation(&[("https://example.com/a", "h1")]);
        let baseline = Baseline::from_observation(
            "example",
            "Example",
            DetectionMethod::Sitemap,
            &obs,
            Utc::now(),
        );
        assert!(baseline.content_hashes.is_empty());
        assert!(!baseline.urls.is_empty());
    }

    #[test]
    fn test_roundtrip_through_serde() {
        let obs = make_observation(&[("https://example.com/a", "h1")]);
        let baseline = Baseline::from_observation(
            "example",
            "Example",
            DetectionMethod::Content,
            &obs,
            Utc::now(),
        );

        let json = serde_json::to_string(&baseline).unwrap();
        let back: Baseline = serde_json::from_str(&json).unwrap();
        assert_eq!(back, baseline);
    }

    #[test]
    fn test_as_observation_preserves_hashes() {
        let obs = make_observation(&[("https://example.com/a", "h1")]);
        let baseline = Baseline::from_observation(
            "example",
            "Example",
            DetectionMethod::Content,
            &obs,
            Utc::now(),
        );

        let reobserved = baseline.as_observation();
        assert_eq!(reobserved.urls, baseline.urls);
        assert_eq!(reobserved.hash_of("https://example.com/a"), Some("h1"));
    }
}
