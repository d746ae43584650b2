// src/storage/baselines.rs

//! Baseline persistence.
//!
//! Each site owns a directory of immutable baseline documents plus an
//! append-only event log. Two advisory file locks guard it:
//!
//! - `run.lock` is exclusive for the duration of a detection run, enforcing
//!   at-most-one run per site; waiters give up after a bounded interval.
//! - `store.lock` is held briefly: exclusive around writes, shared around
//!   reads. Cross-site operations never contend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{Baseline, BaselineEvent, EvolutionType};
use crate::storage::write_bytes_atomic;

const EVENTS_FILE: &str = "events.jsonl";
const RUN_LOCK_FILE: &str = "run.lock";
const STORE_LOCK_FILE: &str = "store.lock";

/// Poll interval while waiting on a busy run lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(250);

fn baseline_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^baseline_\d{8}_\d{6}_[0-9a-f]{8}\.json$").expect("valid baseline pattern")
    })
}

/// Exclusive per-site run lock, released on drop.
pub struct SiteLock {
    _file: std::fs::File,
}

/// Outcome of validating a baseline document.
#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Filesystem-backed store for baseline history and events.
pub struct BaselineStore {
    root: PathBuf,
}

impl BaselineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn site_dir(&self, site_id: &str) -> PathBuf {
        self.root.join(site_id)
    }

    fn open_lock_file(&self, site_id: &str, name: &str) -> Result<std::fs::File> {
        let dir = self.site_dir(site_id);
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(name))?;
        Ok(file)
    }

    /// Acquire the exclusive run lock for a site, waiting up to `wait`.
    pub async fn lock_site(&self, site_id: &str, wait: Duration) -> Result<SiteLock> {
        let deadline = Instant::now() + wait;
        loop {
            let file = self.open_lock_file(site_id, RUN_LOCK_FILE)?;
            if file.try_lock_exclusive().is_ok() {
                return Ok(SiteLock { _file: file });
            }
            if Instant::now() >= deadline {
                return Err(AppError::BusySite {
                    site: site_id.to_string(),
                });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    fn store_write_guard(&self, site_id: &str) -> Result<std::fs::File> {
        let file = self.open_lock_file(site_id, STORE_LOCK_FILE)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn store_read_guard(&self, site_id: &str) -> Result<Option<std::fs::File>> {
        if !self.site_dir(site_id).exists() {
            return Ok(None);
        }
        let file = self.open_lock_file(site_id, STORE_LOCK_FILE)?;
        file.lock_shared()?;
        Ok(Some(file))
    }

    /// Deterministic identifier for a baseline document:
    /// `baseline_<timestamp>_<short content hash>.json`.
    pub fn identifier_for(baseline: &Baseline) -> Result<String> {
        let bytes = serde_json::to_vec_pretty(baseline)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(format!(
            "baseline_{}_{}.json",
            baseline.created_at.format("%Y%m%d_%H%M%S"),
            &digest[..8]
        ))
    }

    /// Persist a baseline atomically and return its identifier.
    pub async fn save(&self, baseline: &Baseline) -> Result<String> {
        let id = Self::identifier_for(baseline)?;
        let path = self.site_dir(&baseline.site_id).join(&id);
        let bytes = serde_json::to_vec_pretty(baseline)?;

        let _guard = self.store_write_guard(&baseline.site_id)?;
        write_bytes_atomic(&path, &bytes).await?;
        Ok(id)
    }

    /// Baseline identifiers for a site, newest first.
    ///
    /// The timestamp prefix sorts lexicographically; ties on identical
    /// timestamps fall back to the identifier itself.
    pub async fn list(&self, site_id: &str) -> Result<Vec<String>> {
        let _guard = self.store_read_guard(site_id)?;
        let dir = self.site_dir(site_id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if baseline_file_pattern().is_match(&name) {
                names.push(name);
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Load a baseline by identifier.
    pub async fn load(&self, site_id: &str, baseline_id: &str) -> Result<Baseline> {
        let _guard = self.store_read_guard(site_id)?;
        let path = self.site_dir(site_id).join(baseline_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::BaselineNotFound {
                    site: site_id.to_string(),
                    id: baseline_id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The latest baseline for a site, if any exists.
    pub async fn latest(&self, site_id: &str) -> Result<Option<Baseline>> {
        match self.list(site_id).await?.first() {
            Some(id) => Ok(Some(self.load(site_id, id).await?)),
            None => Ok(None),
        }
    }

    /// Structural validation of a baseline document.
    ///
    /// Passing the predecessor enables the relative checks (timestamp order,
    /// abrupt URL-count swings).
    pub fn validate(baseline: &Baseline, previous: Option<&Baseline>) -> ValidationReport {
        let mut report = ValidationReport::default();

        if baseline.site_id.is_empty() {
            report.errors.push("missing site id".to_string());
        }

        let mut seen = HashSet::new();
        for url in &baseline.urls {
            if !seen.insert(url.as_str()) {
                report.errors.push(format!("duplicate URL: {url}"));
            }
        }

        if baseline.has_content_method() {
            if baseline.urls.len() != baseline.content_hashes.len() {
                report.errors.push(format!(
                    "URL count {} does not match content-hash count {}",
                    baseline.urls.len(),
                    baseline.content_hashes.len()
                ));
            }
            for url in baseline.content_hashes.keys() {
                if !seen.contains(url.as_str()) {
                    report.errors.push(format!("content hash for unknown URL: {url}"));
                }
            }
        }

        for (url, entry) in &baseline.content_hashes {
            if entry.hash.is_empty() && entry.length != 0 {
                report
                    .errors
                    .push(format!("empty hash with non-zero length for {url}"));
            }
        }

        if let Some(previous_at) = baseline.previous_created_at {
            if previous_at > baseline.created_at {
                report
                    .warnings
                    .push("predecessor timestamp is in the future".to_string());
            }
        }

        if let Some(previous) = previous {
            let before = previous.urls.len();
            let after = baseline.urls.len();
            if before > 0 {
                let delta = before.abs_diff(after) as f64 / before as f64;
                if delta > 0.5 {
                    report.warnings.push(format!(
                        "abrupt URL count change: {before} -> {after}"
                    ));
                }
            }
        }

        report
    }

    /// Remove old baselines, keeping the `keep` most recent plus the initial
    /// baseline. Returns the number of files removed.
    pub async fn prune(&self, site_id: &str, keep: usize) -> Result<usize> {
        let names = self.list(site_id).await?;
        if names.len() <= keep + 1 {
            return Ok(0);
        }

        let mut retained: HashSet<&str> = names.iter().take(keep).map(|n| n.as_str()).collect();
        if let Some(initial) = names.last() {
            retained.insert(initial.as_str());
        }

        let _guard = self.store_write_guard(site_id)?;
        let dir = self.site_dir(site_id);
        let mut removed = 0;
        for name in &names {
            if !retained.contains(name.as_str()) {
                tokio::fs::remove_file(dir.join(name)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Append one event to the site's event log.
    pub async fn append_event(&self, event: &BaselineEvent) -> Result<()> {
        let dir = self.site_dir(&event.site_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.store_write_guard(&event.site_id)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// The most recent events for a site, newest first.
    pub async fn events(&self, site_id: &str, limit: usize) -> Result<Vec<BaselineEvent>> {
        let _guard = self.store_read_guard(site_id)?;
        let path = self.site_dir(site_id).join(EVENTS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events: Vec<BaselineEvent> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    /// Re-issue an older baseline as latest.
    ///
    /// The target document is copied forward with a fresh timestamp and
    /// `manual_rollback` evolution type; history stays intact.
    pub async fn rollback(
        &self,
        site_id: &str,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let target = self.load(site_id, target_id).await?;
        let previous_id = self.list(site_id).await?.into_iter().next();
        let previous_created_at = match &previous_id {
            Some(id) => Some(self.load(site_id, id).await?.created_at),
            None => None,
        };

        let mut reissued = target;
        reissued.evolution_type = EvolutionType::ManualRollback;
        reissued.previous_created_at = previous_created_at;
        reissued.created_at = now;
        reissued.change_summary = Default::default();

        let new_id = self.save(&reissued).await?;

        let mut event =
            BaselineEvent::new(site_id, crate::models::BaselineEventKind::RolledBack, now)
                .with_new_baseline(new_id.clone());
        if let Some(previous_id) = previous_id {
            event = event.with_previous_baseline(previous_id);
        }
        self.append_event(&event).await?;

        Ok(new_id)
    }
}
