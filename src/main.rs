use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use by_event_harvest_lib::config::HarvestConfig;
use by_event_harvest_lib::{logging, parse_source_list, run, scraping, utils, RunOptions};

#[derive(Parser)]
#[command(name = "by-event-harvest")]
#[command(about = "Harvests Belarusian event listings into one JSON Lines file")]
#[command(version)]
struct Cli {
    /// Sources to run, comma-separated. See --list-sources.
    #[arg(long, default_value = "relax")]
    sources: String,
    /// Maximum events per source.
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Output file; defaults to events.jsonl in the data directory.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Skip coordinate lookups.
    #[arg(long)]
    no_geocode: bool,
    /// JSON config file; defaults to config.json in the data directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Detail pages fetched in parallel per source.
    #[arg(long)]
    detail_concurrency: Option<usize>,
    /// Print the available sources and exit.
    #[arg(long)]
    list_sources: bool,
    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    if cli.list_sources {
        for source in scraping::list_sources() {
            println!("{:<14} {:<20} {}", source.id, source.name, source.url);
        }
        return Ok(());
    }

    let mut config = HarvestConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(workers) = cli.detail_concurrency {
        config.detail_concurrency = workers;
    }
    let options = RunOptions {
        sources: parse_source_list(&cli.sources),
        limit: cli.limit,
        out: cli.out.unwrap_or_else(utils::default_output_path),
        geocode: !cli.no_geocode,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing with events collected so far");
            on_signal.cancel();
        }
    });

    let summary = run(&config, &options, cancel).await?;
    for name in &summary.unknown {
        eprintln!("Unknown source: {name}");
    }
    for report in &summary.reports {
        if let Some(error) = &report.error {
            eprintln!("{} failed: {error}", report.source);
        }
    }
    println!("Wrote {} events to {}", summary.written, summary.out.display());
    Ok(())
}
