use anyhow::Result;
use filing_harvest::{config::Config, content::PdfTextExtractor, pipeline::inspect};
use std::sync::Arc;

pub fn show_status(
    mut config: Config,
    date_token: Option<String>,
    incremental: bool,
    format: &str,
) -> Result<()> {
    if let Some(token) = date_token {
        config.run.date_token = Some(token);
    }
    config.incremental.enabled |= incremental;

    let report = inspect(&config, Arc::new(PdfTextExtractor::new()))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\nRun Status ({})", report.date_token);
    println!("=====================");
    for file in &report.files {
        match (file.exists, file.rows) {
            (true, Some(rows)) => println!("  {} ({} rows)", file.path.display(), rows),
            (true, None) => println!("  {} (unreadable)", file.path.display()),
            (false, _) => println!("  {} (missing)", file.path.display()),
        }
    }

    match &report.downloads {
        Some(d) => {
            println!("\nDownloads:");
            println!("  Total:              {}", d.total);
            println!("  Already completed:  {}", d.already_completed);
            println!("  Failed (retry):     {}", d.failed);
            println!("  Corrupted (retry):  {}", d.corrupted);
            println!("  Not attempted:      {}", d.remaining);
        }
        None => println!("\nDownloads: references not extracted yet"),
    }

    if let Some(a) = &report.analysis {
        println!("\nAnalysis:");
        println!("  Analyzable:         {}", a.total);
        println!("  Completed:          {}", a.completed);
        println!("  Remaining:          {}", a.remaining);
    }

    Ok(())
}
