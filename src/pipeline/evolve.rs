// src/pipeline/evolve.rs

//! Baseline evolution.
//!
//! Merges the previous baseline, the current observation, and the classified
//! change set into the successor baseline, then commits it through the
//! store. Re-running on identical inputs produces a byte-identical baseline
//! apart from the creation timestamp.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{
    Baseline, BaselineEvent, BaselineEventKind, BaselineMetadata, ChangeKind, ChangeRecord,
    ChangeSummary, DetectionMethod, EvolutionType, HashEntry, Observation, SiteConfig,
    BASELINE_VERSION,
};
use crate::pipeline::classify::unchanged_count;
use crate::storage::BaselineStore;

/// Outcome of one evolution attempt.
#[derive(Debug)]
pub enum EvolutionOutcome {
    /// A baseline was written and is now latest
    Committed { baseline_id: String },
    /// No changes and no revalidation request; previous baseline stands
    Unchanged,
    /// Proposed successor failed validation; previous baseline stands
    Rejected { errors: Vec<String> },
}

/// Construct the successor baseline from the merge rules.
pub fn build_next(
    previous: &Baseline,
    current: &Observation,
    changes: &[ChangeRecord],
    method: DetectionMethod,
    now: DateTime<Utc>,
) -> Baseline {
    let deleted: BTreeSet<&str> = changes
        .iter()
        .filter(|r| r.kind == ChangeKind::DeletedPage)
        .map(|r| r.url.as_str())
        .collect();

    // URLs whose hash is replaced this run: new or modified, with evidence.
    let replaced: BTreeMap<&str, &str> = changes
        .iter()
        .filter(|r| matches!(r.kind, ChangeKind::NewPage | ChangeKind::ModifiedContent))
        .filter_map(|r| r.new_hash.as_deref().map(|h| (r.url.as_str(), h)))
        .collect();

    let urls: BTreeSet<String> = previous
        .urls
        .iter()
        .chain(current.urls.iter())
        .filter(|u| !deleted.contains(u.as_str()))
        .cloned()
        .collect();

    let content_hashes: BTreeMap<String, HashEntry> = if method.uses_content() {
        urls.iter()
            .map(|url| {
                let entry = if let Some(hash) = replaced.get(url.as_str()) {
                    HashEntry {
                        hash: hash.to_string(),
                        length: current
                            .fingerprints
                            .get(url)
                            .map(|fp| fp.content_length)
                            .unwrap_or(0),
                    }
                } else if let Some(entry) = previous.content_hashes.get(url) {
                    entry.clone()
                } else if let Some(fp) = current.fingerprints.get(url).filter(|fp| !fp.is_missing())
                {
                    HashEntry::from(fp)
                } else {
                    // Sitemap-only knowledge of this URL.
                    HashEntry {
                        hash: String::new(),
                        length: 0,
                    }
                };
                (url.clone(), entry)
            })
            .collect()
    } else {
        BTreeMap::new()
    };

    Baseline {
        site_id: previous.site_id.clone(),
        site_name: previous.site_name.clone(),
        created_at: now,
        previous_created_at: Some(previous.created_at),
        baseline_version: BASELINE_VERSION.to_string(),
        evolution_type: EvolutionType::AutomaticUpdate,
        urls: urls.into_iter().collect(),
        content_hashes,
        change_summary: ChangeSummary::from_records(changes, unchanged_count(previous, current)),
        metadata: BaselineMetadata {
            method,
            hash_algorithm: "sha256".to_string(),
            sitemap: current
                .sitemap
                .clone()
                .or_else(|| previous.metadata.sitemap.clone()),
        },
    }
}

/// Apply one evolution step and commit the result through the store.
///
/// Nothing is written when the change set is empty, except that an explicit
/// revalidation request re-checks the standing baseline and records a
/// `validated` event.
#[allow(clippy::too_many_arguments)]
pub async fn evolve(
    store: &BaselineStore,
    site: &SiteConfig,
    method: DetectionMethod,
    previous: Option<&Baseline>,
    current: &Observation,
    changes: &[ChangeRecord],
    revalidate: bool,
    now: DateTime<Utc>,
) -> Result<EvolutionOutcome> {
    let Some(previous) = previous else {
        // Initial-creation branch: no predecessor, no change records.
        let initial =
            Baseline::from_observation(site.id.clone(), site.name.clone(), method, current, now);
        let report = BaselineStore::validate(&initial, None);
        if !report.errors.is_empty() {
            warn!(site = %site.id, errors = ?report.errors, "initial baseline failed validation");
            let event = BaselineEvent::new(&site.id, BaselineEventKind::ValidationFailed, now)
                .with_errors(report.errors.clone());
            store.append_event(&event).await?;
            return Ok(EvolutionOutcome::Rejected {
                errors: report.errors,
            });
        }

        let baseline_id = store.save(&initial).await?;
        let event = BaselineEvent::new(&site.id, BaselineEventKind::Created, now)
            .with_counts(initial.change_summary)
            .with_new_baseline(baseline_id.clone());
        store.append_event(&event).await?;
        info!(site = %site.id, baseline = %baseline_id, urls = initial.urls.len(), "initial baseline created");
        return Ok(EvolutionOutcome::Committed { baseline_id });
    };

    if changes.is_empty() {
        if revalidate {
            let report = BaselineStore::validate(previous, None);
            let event = BaselineEvent::new(&site.id, BaselineEventKind::Validated, now)
                .with_previous_baseline(BaselineStore::identifier_for(previous)?)
                .with_errors(report.errors);
            store.append_event(&event).await?;
        }
        return Ok(EvolutionOutcome::Unchanged);
    }

    let next = build_next(previous, current, changes, method, now);
    let report = BaselineStore::validate(&next, Some(previous));
    for warning in &report.warnings {
        warn!(site = %site.id, warning, "baseline validation warning");
    }
    if !report.errors.is_empty() {
        warn!(site = %site.id, errors = ?report.errors, "proposed baseline rejected, keeping predecessor");
        let event = BaselineEvent::new(&site.id, BaselineEventKind::ValidationFailed, now)
            .with_previous_baseline(BaselineStore::identifier_for(previous)?)
            .with_errors(report.errors.clone());
        store.append_event(&event).await?;
        return Ok(EvolutionOutcome::Rejected {
            errors: report.errors,
        });
    }

    let baseline_id = store.save(&next).await?;
    let event = BaselineEvent::new(&site.id, BaselineEventKind::Updated, now)
        .with_counts(next.change_summary)
        .with_previous_baseline(BaselineStore::identifier_for(previous)?)
        .with_new_baseline(baseline_id.clone());
    store.append_event(&event).await?;
    info!(
        site = %site.id,
        baseline = %baseline_id,
        new = next.change_summary.new,
        modified = next.change_summary.modified,
        deleted = next.change_summary.deleted,
        "baseline evolved"
    );

    Ok(EvolutionOutcome::Committed { baseline_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentFingerprint;
    use crate::pipeline::classify::classify;
    use tempfile::TempDir;

    fn make_site() -> SiteConfig {
        SiteConfig {
            id: "example".to_string(),
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            sitemap_url: None,
            methods: vec![DetectionMethod::Hybrid],
            check_interval_minutes: 60,
            active: true,
        }
    }

    /// Observation fixture: `Some(hash)` is a real fingerprint, `None` is the
    /// failed-fetch sentinel.
    fn make_observation(entries: &[(&str, Option<&str>)]) -> Observation {
        let now = Utc::now();
        let mut obs = Observation::new(entries.iter().map(|(u, _)| u.to_string()), now);
        for (url, hash) in entries {
            let fp = match hash {
                Some(hash) => ContentFingerprint {
                    hash: hash.to_string(),
                    content_length: hash.len() as u64,
                    status: Some(200),
                    fetched_at: now,
                    preview: None,
                },
                None => ContentFingerprint::missing(None, now),
            };
            obs.fingerprints.insert(url.to_string(), fp);
        }
        obs
    }

    async fn seed_baseline(store: &BaselineStore, entries: &[(&str, Option<&str>)]) -> Baseline {
        let site = make_site();
        let obs = make_observation(entries);
        let outcome = evolve(
            store,
            &site,
            DetectionMethod::Hybrid,
            None,
            &obs,
            &[],
            false,
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, EvolutionOutcome::Committed { .. }));
        store.latest(&site.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_initial_creation() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());

        let baseline = seed_baseline(
            &store,
            &[
                ("https://e.com/a", Some("h1")),
                ("https://e.com/b", Some("h2")),
                ("https://e.com/c", Some("h3")),
            ],
        )
        .await;

        assert_eq!(baseline.evolution_type, EvolutionType::Initial);
        assert_eq!(baseline.urls.len(), 3);
        assert_eq!(baseline.hash_of("https://e.com/a"), Some("h1"));
        assert_eq!(baseline.change_summary.total_changes(), 0);

        let events = store.events("example", 10).await.unwrap();
        assert!(matches!(events[0].kind, BaselineEventKind::Created));
    }

    #[tokio::test]
    async fn test_pure_addition() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(
            &store,
            &[("https://e.com/a", Some("h1")), ("https://e.com/b", Some("h2"))],
        )
        .await;

        let current = make_observation(&[
            ("https://e.com/a", Some("h1")),
            ("https://e.com/b", Some("h2")),
            ("https://e.com/c", Some("h3")),
        ]);
        let now = Utc::now();
        let changes = classify(&previous, &current, now);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::NewPage);
        assert_eq!(changes[0].new_hash.as_deref(), Some("h3"));

        let outcome = evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&previous),
            &current,
            &changes,
            false,
            now,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, EvolutionOutcome::Committed { .. }));

        let latest = store.latest("example").await.unwrap().unwrap();
        assert_eq!(latest.evolution_type, EvolutionType::AutomaticUpdate);
        assert_eq!(latest.urls.len(), 3);
        assert_eq!(latest.hash_of("https://e.com/c"), Some("h3"));
        assert_eq!(latest.previous_created_at, Some(previous.created_at));
        assert_eq!(latest.change_summary.new, 1);
    }

    #[tokio::test]
    async fn test_deletion() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(
            &store,
            &[
                ("https://e.com/a", Some("h1")),
                ("https://e.com/b", Some("h2")),
                ("https://e.com/c", Some("h3")),
            ],
        )
        .await;

        let current = make_observation(&[
            ("https://e.com/a", Some("h1")),
            ("https://e.com/c", Some("h3")),
        ]);
        let now = Utc::now();
        let changes = classify(&previous, &current, now);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::DeletedPage);
        assert_eq!(changes[0].previous_hash.as_deref(), Some("h2"));

        evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&previous),
            &current,
            &changes,
            false,
            now,
        )
        .await
        .unwrap();

        let latest = store.latest("example").await.unwrap().unwrap();
        assert_eq!(latest.urls.len(), 2);
        assert!(!latest.urls.iter().any(|u| u == "https://e.com/b"));
        assert!(!latest.content_hashes.contains_key("https://e.com/b"));
    }

    #[tokio::test]
    async fn test_modification() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(
            &store,
            &[("https://e.com/a", Some("h1")), ("https://e.com/b", Some("h2"))],
        )
        .await;

        let current = make_observation(&[
            ("https://e.com/a", Some("h1_new")),
            ("https://e.com/b", Some("h2")),
        ]);
        let now = Utc::now();
        let changes = classify(&previous, &current, now);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::ModifiedContent);

        evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&previous),
            &current,
            &changes,
            false,
            now,
        )
        .await
        .unwrap();

        let latest = store.latest("example").await.unwrap().unwrap();
        assert_eq!(latest.hash_of("https://e.com/a"), Some("h1_new"));
        assert_eq!(latest.hash_of("https://e.com/b"), Some("h2"));
    }

    #[tokio::test]
    async fn test_mixed_with_partial_fetch_failure() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(
            &store,
            &[
                ("https://e.com/a", Some("h1")),
                ("https://e.com/b", Some("h2")),
                ("https://e.com/c", Some("h3")),
            ],
        )
        .await;

        // C's fetch failed this run; D is new; A changed; B is untouched.
        let current = make_observation(&[
            ("https://e.com/a", Some("h1_new")),
            ("https://e.com/b", Some("h2")),
            ("https://e.com/c", None),
            ("https://e.com/d", Some("h4")),
        ]);
        let now = Utc::now();
        let changes = classify(&previous, &current, now);

        let kinds: Vec<_> = changes.iter().map(|r| (r.kind, r.url.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::NewPage, "https://e.com/d"),
                (ChangeKind::ModifiedContent, "https://e.com/a"),
            ]
        );

        evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&previous),
            &current,
            &changes,
            false,
            now,
        )
        .await
        .unwrap();

        let latest = store.latest("example").await.unwrap().unwrap();
        assert_eq!(latest.urls.len(), 4);
        assert_eq!(latest.hash_of("https://e.com/a"), Some("h1_new"));
        assert_eq!(latest.hash_of("https://e.com/b"), Some("h2"));
        // Stale hash preserved when evidence is missing.
        assert_eq!(latest.hash_of("https://e.com/c"), Some("h3"));
        assert_eq!(latest.hash_of("https://e.com/d"), Some("h4"));
    }

    #[tokio::test]
    async fn test_no_changes_commits_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(&store, &[("https://e.com/a", Some("h1"))]).await;

        let current = previous.as_observation();
        let now = Utc::now();
        let changes = classify(&previous, &current, now);
        assert!(changes.is_empty());

        let outcome = evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&previous),
            &current,
            &changes,
            false,
            now,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, EvolutionOutcome::Unchanged));
        assert_eq!(store.list("example").await.unwrap().len(), 1);

        // No validated event without an explicit revalidation request.
        let events = store.events("example", 10).await.unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, BaselineEventKind::Validated)));

        // With revalidation requested, the event is appended but the
        // baseline is still not re-committed.
        evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&previous),
            &current,
            &changes,
            true,
            now,
        )
        .await
        .unwrap();
        assert_eq!(store.list("example").await.unwrap().len(), 1);
        let events = store.events("example", 10).await.unwrap();
        assert!(matches!(events[0].kind, BaselineEventKind::Validated));
    }

    #[tokio::test]
    async fn test_evolution_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(&store, &[("https://e.com/a", Some("h1"))]).await;

        let current = make_observation(&[
            ("https://e.com/a", Some("h1")),
            ("https://e.com/b", Some("h2")),
        ]);
        let now = Utc::now();
        let changes = classify(&previous, &current, now);

        let first = build_next(&previous, &current, &changes, DetectionMethod::Hybrid, now);
        let second = build_next(&previous, &current, &changes, DetectionMethod::Hybrid, now);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec_pretty(&first).unwrap(),
            serde_json::to_vec_pretty(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_validation_failure_aborts_commit() {
        let tmp = TempDir::new().unwrap();
        let store = BaselineStore::new(tmp.path());
        let previous = seed_baseline(&store, &[("https://e.com/a", Some("h1"))]).await;

        let current = make_observation(&[
            ("https://e.com/a", Some("h1")),
            ("https://e.com/b", Some("h2")),
        ]);
        let now = Utc::now();
        let changes = classify(&previous, &current, now);

        // Sabotage the predecessor: an empty-hash entry with non-zero length
        // is carried into the merged successor unchanged and fails
        // validation there.
        let mut poisoned = previous.clone();
        poisoned.content_hashes.insert(
            "https://e.com/a".to_string(),
            HashEntry {
                hash: String::new(),
                length: 10,
            },
        );

        let outcome = evolve(
            &store,
            &make_site(),
            DetectionMethod::Hybrid,
            Some(&poisoned),
            &current,
            &changes,
            false,
            now,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, EvolutionOutcome::Rejected { .. }));
        // Previous baseline remains latest.
        let latest = store.latest("example").await.unwrap().unwrap();
        assert_eq!(latest.created_at, previous.created_at);
        let events = store.events("example", 1).await.unwrap();
        assert!(matches!(events[0].kind, BaselineEventKind::ValidationFailed));
    }
}
