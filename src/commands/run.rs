use anyhow::Result;
use filing_harvest::{
    config::Config,
    fetching::cancel_pair,
    pipeline::{Collaborators, RunSummary, StageOrchestrator},
};
use std::path::PathBuf;
use tracing::{info, warn};

/// Command-line values that take precedence over the config file
pub struct RunOverrides {
    pub resume: bool,
    pub incremental: bool,
    pub baseline: Option<PathBuf>,
    pub limit: Option<u64>,
    pub date_token: Option<String>,
    pub feed: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl RunOverrides {
    fn apply(self, config: &mut Config) {
        config.run.resume |= self.resume;
        if self.incremental || self.baseline.is_some() {
            config.incremental.enabled = true;
        }
        if let Some(baseline) = self.baseline {
            config.incremental.baseline_path = Some(baseline);
        }
        if let Some(limit) = self.limit {
            config.run.index_limit = Some(limit);
        }
        if let Some(token) = self.date_token {
            config.run.date_token = Some(token);
        }
        if let Some(feed) = self.feed {
            config.feed.local_path = Some(feed);
        }
        if let Some(dir) = self.output_dir {
            // Artifacts follow the output directory unless configured apart
            if let Ok(rest) = config.run.artifact_dir.strip_prefix(&config.run.output_dir) {
                config.run.artifact_dir = dir.join(rest);
            }
            config.run.output_dir = dir;
        }
    }
}

pub async fn run_pipeline(mut config: Config, overrides: RunOverrides, quiet: bool) -> Result<()> {
    overrides.apply(&mut config);
    config.validate()?;

    let collaborators = Collaborators::from_config(&config)?;
    let (handle, signal) = cancel_pair();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current entity");
            handle.cancel();
        }
    });

    let orchestrator = StageOrchestrator::new(config, collaborators, signal).with_quiet(quiet);
    let summary_path = orchestrator.files().summary.clone();

    match orchestrator.run().await {
        Ok(summary) => {
            print_summary(&summary);
            println!("Summary: {}", summary_path.display());
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            let context = orchestrator.context();
            info!("Run cancelled in phase {}", context.phase());
            println!(
                "\nRun cancelled. Completed work is saved; rerun with --resume to continue."
            );
            println!("Summary: {}", summary_path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(summary: &RunSummary) {
    let ctx = &summary.context;

    println!("\nRun Complete");
    println!("============");
    println!("Run id:               {}", ctx.run_id);
    println!("Date token:           {}", summary.date_token);
    println!(
        "Mode:                 {}{}",
        if summary.resume { "resume" } else { "standard" },
        if summary.incremental { ", incremental" } else { "" }
    );
    println!("Entities processed:   {}", ctx.processed_entities);
    println!("Downloads succeeded:  {}", ctx.successful_downloads);
    println!("Downloads failed:     {}", ctx.failed_downloads);
    println!("Artifacts analyzed:   {}", ctx.items_analyzed);
    println!("Elapsed:              {:.1}s", ctx.elapsed_ms as f64 / 1000.0);

    println!("\nStages:");
    for stage in &summary.stages {
        println!(
            "  {:<24} {:<8} {:>6} done {:>6} skipped {:>6} failed{}",
            stage.phase.to_string(),
            format!("{:?}", stage.mode).to_lowercase(),
            stage.counts.done,
            stage.counts.skipped,
            stage.counts.failed,
            if stage.reused { "  (reused)" } else { "" }
        );
        if let Some(diff) = &stage.incremental {
            println!(
                "      incremental: {} new, {} updated, {} unchanged ({} without a usable date)",
                diff.new, diff.updated, diff.unchanged, diff.unparseable
            );
        }
        if let Some(resume) = &stage.resume {
            println!(
                "      resume: {} of {} already complete, {} failed, {} corrupted, {} remaining",
                resume.already_completed, resume.total, resume.failed, resume.corrupted, resume.remaining
            );
        }
    }
}
