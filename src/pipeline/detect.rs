// src/pipeline/detect.rs

//! Detection runs.
//!
//! Orchestrates one site through URL resolution, fingerprinting,
//! classification and baseline evolution, then emits the change report and
//! state snapshot. Sites run in parallel; each site is serialized by its run
//! lock and bounded by the whole-run deadline.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    BaselineEvent, BaselineEventKind, ChangeReport, ChangeSummary, DetectionMethod, Observation,
    SiteConfig, SourceMetadata,
};
use crate::pipeline::classify::{classify, unchanged_count};
use crate::pipeline::evolve::{evolve, EvolutionOutcome};
use crate::pipeline::progress::{ProgressBoard, RunStage};
use crate::services::{Fetcher, Fingerprinter, SitemapResolver};
use crate::storage::{BaselineStore, ReportWriter};

/// Sites processed in parallel; fetch concurrency is bounded separately by
/// the shared semaphore.
const SITE_CONCURRENCY: usize = 4;

/// Process-wide state shared by every detection run.
///
/// The only cross-run state is the fetch semaphore, the configuration
/// snapshot, and the progress board; each run builds its own engine pieces.
pub struct DetectionContext {
    pub config: Arc<Config>,
    pub semaphore: Arc<Semaphore>,
    pub store: Arc<BaselineStore>,
    pub progress: Arc<ProgressBoard>,
}

impl DetectionContext {
    pub fn new(config: Arc<Config>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.options.max_concurrent_fetches));
        let store = Arc::new(BaselineStore::new(&config.options.baseline_root));
        Self {
            config,
            semaphore,
            store,
            progress: Arc::new(ProgressBoard::new()),
        }
    }
}

/// Result of one (site, method) detection run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub site_id: String,
    pub method: DetectionMethod,
    pub summary: ChangeSummary,
    pub baseline_updated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_file: Option<String>,
}

/// Run detection for one site: every enabled method, under the site's run
/// lock and the whole-run deadline.
pub async fn run_site(
    ctx: &DetectionContext,
    site: &SiteConfig,
    writer: &ReportWriter,
    revalidate: bool,
) -> Result<Vec<RunOutcome>> {
    let options = &ctx.config.options;
    let _lock = ctx.store.lock_site(&site.id, options.lock_wait()).await?;

    match tokio::time::timeout(
        options.run_deadline(),
        run_site_inner(ctx, site, writer, revalidate),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(site = %site.id, "run deadline exceeded, discarding partial results");
            let event = BaselineEvent::new(&site.id, BaselineEventKind::RunAborted, Utc::now());
            ctx.store.append_event(&event).await?;
            ctx.progress.stage(&site.id, RunStage::Failed);
            Err(AppError::DeadlineExceeded {
                site: site.id.clone(),
            })
        }
    }
}

async fn run_site_inner(
    ctx: &DetectionContext,
    site: &SiteConfig,
    writer: &ReportWriter,
    revalidate: bool,
) -> Result<Vec<RunOutcome>> {
    let fetcher = Fetcher::new(
        &ctx.config.options,
        ctx.config.proxy.as_ref(),
        ctx.semaphore.clone(),
    )?;

    let mut outcomes = Vec::with_capacity(site.methods.len());
    for method in &site.methods {
        match run_method(ctx, site, *method, &fetcher, writer, revalidate).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                ctx.progress.stage(&site.id, RunStage::Failed);
                return Err(e);
            }
        }
    }
    Ok(outcomes)
}

async fn run_method(
    ctx: &DetectionContext,
    site: &SiteConfig,
    method: DetectionMethod,
    fetcher: &Fetcher,
    writer: &ReportWriter,
    revalidate: bool,
) -> Result<RunOutcome> {
    let options = &ctx.config.options;
    let started = Utc::now();
    ctx.progress.begin(&site.id, method);
    info!(site = %site.id, %method, "detection run starting");

    let previous = ctx.store.latest(&site.id).await?;

    // URL universe: content-only runs reuse the baseline's URL list; sitemap
    // and hybrid runs (and first-ever content runs) resolve the sitemap.
    let (urls, sitemap_info) = match (method, &previous) {
        (DetectionMethod::Content, Some(baseline)) => (baseline.urls.clone(), None),
        _ => {
            let (urls, info) = SitemapResolver::new(fetcher).resolve(site).await?;
            (urls, Some(info))
        }
    };

    let mut observation = Observation::new(urls, started);
    observation.sitemap = sitemap_info;

    if method.uses_content() {
        ctx.progress.stage(&site.id, RunStage::Fingerprinting);
        let fingerprinter =
            Fingerprinter::new(fetcher, options.batch_size, options.max_concurrent_fetches);
        let urls_to_hash = observation.urls.clone();
        let set = fingerprinter
            .fingerprint_all(&urls_to_hash, |done, total| {
                ctx.progress.batches(&site.id, done, total)
            })
            .await;
        observation.fingerprints = set.fingerprints;
        observation.ignored = set.ignored;
    }

    ctx.progress.stage(&site.id, RunStage::Classifying);
    let detected_at = Utc::now();
    let (changes, summary) = match &previous {
        Some(baseline) => {
            let records = classify(baseline, &observation, detected_at);
            let summary =
                ChangeSummary::from_records(&records, unchanged_count(baseline, &observation));
            (records, summary)
        }
        None => (Vec::new(), ChangeSummary::default()),
    };

    ctx.progress.stage(&site.id, RunStage::Evolving);
    let outcome = evolve(
        &ctx.store,
        site,
        method,
        previous.as_ref(),
        &observation,
        &changes,
        revalidate,
        detected_at,
    )
    .await?;

    let (baseline_updated, baseline_id) = match outcome {
        EvolutionOutcome::Committed { baseline_id } => {
            ctx.store.prune(&site.id, options.retention_count).await?;
            (true, Some(baseline_id))
        }
        EvolutionOutcome::Unchanged => (false, None),
        EvolutionOutcome::Rejected { errors } => {
            error!(site = %site.id, ?errors, "baseline commit rejected");
            (false, None)
        }
    };

    ctx.progress.stage(&site.id, RunStage::WritingReports);
    let report = ChangeReport {
        site: site.id.clone(),
        detected_at,
        method,
        summary,
        source_metadata: SourceMetadata {
            total_urls: observation.urls.len(),
            total_fingerprints: observation.fingerprints.len(),
            sitemap: observation.sitemap.clone(),
        },
        changes,
    };
    let report_path = writer.write_changes(&site.id, &report).await?;
    writer.write_state(&site.id, method, &observation).await?;

    ctx.progress.stage(&site.id, RunStage::Complete);
    info!(
        site = %site.id,
        %method,
        new = summary.new,
        modified = summary.modified,
        deleted = summary.deleted,
        unchanged = summary.unchanged,
        baseline_updated,
        "detection run complete"
    );

    Ok(RunOutcome {
        site_id: site.id.clone(),
        method,
        summary,
        baseline_updated,
        baseline_id,
        report_file: report_path.to_str().map(|s| s.to_string()),
    })
}

/// Run detection for every active site in parallel.
///
/// Per-site failures are collected rather than propagated so one bad site
/// never blocks the rest of the fleet.
pub async fn run_all(
    ctx: &DetectionContext,
    writer: &ReportWriter,
) -> Vec<(String, Result<Vec<RunOutcome>>)> {
    let sites: Vec<SiteConfig> = ctx.config.active_sites().cloned().collect();

    stream::iter(sites)
        .map(|site| async move {
            let result = run_site(ctx, &site, writer, false).await;
            if let Err(e) = &result {
                error!(site = %site.id, error = %e, "site detection failed");
            }
            (site.id, result)
        })
        .buffer_unordered(SITE_CONCURRENCY)
        .collect()
        .await
}
