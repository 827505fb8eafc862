mod cleaner;
mod db;
mod error;
mod fetcher;
mod merge;
mod pipeline;
mod record;
mod settings;
mod verify;
mod writer;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use record::Endpoint;
use settings::{OutputMode, Settings};
use writer::Writer;

#[derive(Parser)]
#[command(name = "drug_collector", about = "MFDS drug approval and pill identification collector")]
struct Cli {
    /// Config file (TOML); DRUGDATA_* environment variables override it
    #[arg(long, global = true, default_value = settings::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, clean and store one endpoint
    Fetch {
        #[arg(value_enum)]
        endpoint: Endpoint,
        /// Output mode (default: from config)
        #[arg(long, value_enum)]
        mode: Option<OutputMode>,
        /// Stop after this many pages
        #[arg(short = 'n', long)]
        max_pages: Option<u32>,
    },
    /// Fetch both endpoints in sequence
    Run {
        #[arg(long, value_enum)]
        mode: Option<OutputMode>,
        #[arg(short = 'n', long)]
        max_pages: Option<u32>,
    },
    /// Join collected approval and pill records on ITEM_SEQ
    Merge,
    /// Check collected records against the public drug search
    Verify {
        #[arg(value_enum)]
        endpoint: Endpoint,
        /// Check a random sample of this many records
        #[arg(short, long)]
        sample: Option<usize>,
        /// Concurrent requests
        #[arg(short, long, default_value_t = verify::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Row counts per database table
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let result = match cli.command {
        Commands::Fetch {
            endpoint,
            mode,
            max_pages,
        } => collect(&settings, endpoint, mode.unwrap_or(settings.mode), max_pages).await,
        Commands::Run { mode, max_pages } => {
            let mode = mode.unwrap_or(settings.mode);
            for endpoint in Endpoint::ALL {
                collect(&settings, endpoint, mode, max_pages).await?;
            }
            Ok(())
        }
        Commands::Merge => {
            let analysis = merge::run(&settings).context("merging approval and pill data")?;
            println!("{}", analysis);
            if analysis.total_unmatched_pills > 0 {
                println!(
                    "{} pill records need additional information (see {})",
                    analysis.total_unmatched_pills,
                    merge::MergePaths::new(&settings).unmatched_pills.display()
                );
            }
            Ok(())
        }
        Commands::Verify {
            endpoint,
            sample,
            concurrency,
        } => {
            let summary = verify::run(&settings, endpoint, verify::SEARCH_URL, sample, concurrency)
                .await
                .with_context(|| format!("verifying {} records", endpoint))?;
            println!(
                "Checked {}: {} registered, {} not registered, {} unknown, {} errors.",
                summary.checked, summary.registered, summary.not_registered, summary.unknown, summary.errors
            );
            println!("Kept records in {}", verify::filtered_path(&settings, endpoint).display());
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)
                .with_context(|| format!("opening {}", settings.db_path.display()))?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Approvals: {}", s.approvals);
            println!("Pills:     {}", s.pills);
            println!("Runs:      {}", s.runs);
            println!("Last run:  {}", s.last_run.as_deref().unwrap_or("-"));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn collect(
    settings: &Settings,
    endpoint: Endpoint,
    mode: OutputMode,
    max_pages: Option<u32>,
) -> anyhow::Result<()> {
    let mut writer = Writer::open(settings, endpoint, mode)
        .with_context(|| format!("opening {} output", endpoint))?;
    let summary = pipeline::run(settings, endpoint, &mut writer, max_pages)
        .await
        .with_context(|| format!("collecting {}", endpoint))?;
    let target = writer
        .finish(&summary)
        .with_context(|| format!("saving {}", endpoint))?;
    println!(
        "{}: {} pages, {} written ({} cancelled, {} export-only, {} duplicate skipped) -> {}",
        endpoint,
        summary.pages,
        summary.written,
        summary.skipped_cancelled,
        summary.skipped_export,
        summary.skipped_duplicate,
        target
    );
    if summary.doc_fallbacks > 0 {
        println!(
            "{} label documents kept as plain text (see {})",
            summary.doc_fallbacks,
            settings.error_report_path().display()
        );
    }
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
