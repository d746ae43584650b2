// src/pipeline/classify.rs

//! Change classification.
//!
//! Pure set comparison between a baseline and a fresh observation. The
//! classifier is total: upstream fetch failures arrive as missing hashes and
//! suppress modification claims, they never surface as errors here.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::models::{Baseline, ChangeKind, ChangeRecord, Observation};

/// Classify the differences between a baseline and the current observation.
///
/// Records are sorted by (kind, URL) so identical inputs produce identical
/// report files.
pub fn classify(
    baseline: &Baseline,
    current: &Observation,
    detected_at: DateTime<Utc>,
) -> Vec<ChangeRecord> {
    let previous_urls = baseline.url_set();
    let current_urls: BTreeSet<&str> = current.urls.iter().map(|u| u.as_str()).collect();

    let mut records = Vec::new();

    // New: in the current observation but not the baseline. A new URL that
    // is also a non-text file is reported as new only, with its file type
    // attached.
    for url in current_urls.difference(&previous_urls) {
        let mut record = ChangeRecord::new(*url, ChangeKind::NewPage, detected_at)
            .with_detail("New URL found in sitemap");
        if let Some(file_type) = current.ignored.get(*url) {
            record = record.with_file_type(file_type.clone());
        } else if let Some(hash) = current.hash_of(url) {
            record = record.with_new_hash(hash);
        }
        records.push(record);
    }

    // Deleted: in the baseline but gone from the current observation.
    for url in previous_urls.difference(&current_urls) {
        let mut record = ChangeRecord::new(*url, ChangeKind::DeletedPage, detected_at)
            .with_detail("URL no longer in sitemap");
        if let Some(hash) = baseline.hash_of(url) {
            record = record.with_previous_hash(hash);
        }
        records.push(record);
    }

    // Modified: present on both sides with two real, differing hashes.
    // Ignored files and URLs with missing evidence are skipped.
    for url in current_urls.intersection(&previous_urls) {
        if current.ignored.contains_key(*url) {
            records.push(
                ChangeRecord::new(*url, ChangeKind::IgnoredFile, detected_at)
                    .with_file_type(current.ignored[*url].clone())
                    .with_detail("Non-text file excluded from content comparison"),
            );
            continue;
        }

        let (Some(previous_hash), Some(current_hash)) =
            (baseline.hash_of(url), current.hash_of(url))
        else {
            continue;
        };
        if previous_hash != current_hash {
            records.push(
                ChangeRecord::new(*url, ChangeKind::ModifiedContent, detected_at)
                    .with_previous_hash(previous_hash)
                    .with_new_hash(current_hash)
                    .with_detail(format!(
                        "Content hash changed from {}... to {}...",
                        &previous_hash[..previous_hash.len().min(8)],
                        &current_hash[..current_hash.len().min(8)]
                    )),
            );
        }
    }

    records.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.url.cmp(&b.url)));
    records
}

/// URLs present in both sets that were neither modified nor ignored.
pub fn unchanged_count(baseline: &Baseline, current: &Observation) -> usize {
    let previous_urls = baseline.url_set();
    let current_urls: BTreeSet<&str> = current.urls.iter().map(|u| u.as_str()).collect();

    current_urls
        .intersection(&previous_urls)
        .filter(|url| {
            if current.ignored.contains_key(**url) {
                return false;
            }
            match (baseline.hash_of(url), current.hash_of(url)) {
                (Some(prev), Some(curr)) => prev == curr,
                // Missing evidence on either side: no modification asserted,
                // the URL counts as unchanged.
                _ => true,
            }
        })
        .count()
}
