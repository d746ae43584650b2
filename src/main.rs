// src/main.rs

//! driftwatch: website change-detection CLI and service.
//!
//! Exit codes in batch mode: 0 success, 1 partial failure, 2 configuration
//! error, 3 run deadline exceeded.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::error;

use driftwatch::config::Config;
use driftwatch::error::{AppError, Result};
use driftwatch::logging;
use driftwatch::pipeline::{run_all, run_site, DetectionContext, RunOutcome};
use driftwatch::server::{self, ServeConfig};
use driftwatch::storage::{BaselineStore, ReportWriter};

#[derive(Parser, Debug)]
#[command(
    name = "driftwatch",
    version,
    about = "Website change detection: sitemap diffing, content fingerprints, evolving baselines"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/sites.toml")]
    config: String,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run detection for one site
    Detect {
        site_id: String,
        /// Re-check the standing baseline even when nothing changed
        #[arg(long)]
        revalidate: bool,
    },
    /// Run detection for every active site (batch mode)
    DetectAll,
    /// Validate the configuration file
    Validate,
    /// Inspect and manage baseline history
    Baselines {
        #[command(subcommand)]
        command: BaselinesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BaselinesCommand {
    /// List baseline history for a site, newest first
    List { site_id: String },
    /// Re-issue an older baseline as latest
    Rollback { site_id: String, baseline_id: String },
    /// Delete old baselines beyond the retention count
    Prune {
        site_id: String,
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            match e {
                AppError::DeadlineExceeded { .. } => ExitCode::from(3),
                AppError::Config(_) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(command: Command, config: Arc<Config>) -> Result<ExitCode> {
    match command {
        Command::Serve { bind, port } => {
            server::serve(config, ServeConfig { bind, port }).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Detect { site_id, revalidate } => {
            let site = config.site(&site_id)?.clone();
            let ctx = DetectionContext::new(Arc::clone(&config));
            let writer = ReportWriter::create(&config.options.output_root, Utc::now()).await?;

            let outcomes = run_site(&ctx, &site, &writer, revalidate).await?;
            for outcome in &outcomes {
                print_outcome(outcome);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::DetectAll => {
            let ctx = DetectionContext::new(Arc::clone(&config));
            let writer = ReportWriter::create(&config.options.output_root, Utc::now()).await?;

            let results = run_all(&ctx, &writer).await;
            let mut failed = 0usize;
            let mut deadline_exceeded = false;

            for (site_id, result) in &results {
                match result {
                    Ok(outcomes) => {
                        for outcome in outcomes {
                            print_outcome(outcome);
                        }
                    }
                    Err(AppError::DeadlineExceeded { .. }) => {
                        deadline_exceeded = true;
                        failed += 1;
                        eprintln!("x {site_id}: run deadline exceeded");
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("x {site_id}: {e}");
                    }
                }
            }

            println!("{} site(s) processed, {} failed", results.len(), failed);

            if deadline_exceeded {
                Ok(ExitCode::from(3))
            } else if failed > 0 {
                Ok(ExitCode::from(1))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }

        Command::Validate => {
            // Loading already validated structure; print a short summary.
            println!("configuration OK");
            println!(
                "  sites: {} ({} active)",
                config.sites.len(),
                config.active_sites().count()
            );
            println!(
                "  max concurrent fetches: {}",
                config.options.max_concurrent_fetches
            );
            println!("  fetch timeout: {}s", config.options.fetch_timeout_secs);
            println!("  retention: {} baselines", config.options.retention_count);
            if config.proxy.is_some() {
                println!("  proxy: tor");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Baselines { command } => {
            let store = BaselineStore::new(&config.options.baseline_root);
            match command {
                BaselinesCommand::List { site_id } => {
                    config.site(&site_id)?;
                    let names = store.list(&site_id).await?;
                    if names.is_empty() {
                        println!("no baselines for '{site_id}'");
                    }
                    for name in names {
                        let baseline = store.load(&site_id, &name).await?;
                        println!(
                            "{name}  {}  {:?}  {} urls",
                            baseline.created_at.format("%Y-%m-%d %H:%M:%S"),
                            baseline.evolution_type,
                            baseline.urls.len()
                        );
                    }
                    Ok(ExitCode::SUCCESS)
                }
                BaselinesCommand::Rollback { site_id, baseline_id } => {
                    config.site(&site_id)?;
                    let _lock = store
                        .lock_site(&site_id, config.options.lock_wait())
                        .await?;
                    let new_id = store.rollback(&site_id, &baseline_id, Utc::now()).await?;
                    println!("rolled back '{site_id}' to {baseline_id}");
                    println!("new latest: {new_id}");
                    Ok(ExitCode::SUCCESS)
                }
                BaselinesCommand::Prune { site_id, keep } => {
                    config.site(&site_id)?;
                    let keep = keep.unwrap_or(config.options.retention_count);
                    let removed = store.prune(&site_id, keep).await?;
                    println!("pruned {removed} baseline(s) from '{site_id}'");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
    }
}

fn print_outcome(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    println!(
        "{} [{}]: {} new, {} modified, {} deleted, {} ignored, {} unchanged{}",
        outcome.site_id,
        outcome.method,
        summary.new,
        summary.modified,
        summary.deleted,
        summary.ignored,
        summary.unchanged,
        if outcome.baseline_updated {
            " (baseline updated)"
        } else {
            ""
        }
    );
    if let Some(report) = &outcome.report_file {
        println!("  report: {report}");
    }
}
