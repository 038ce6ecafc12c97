//! Gridstream Window - fetch row ranges through the chunk cache

use anyhow::{Context, Result};
use clap::Parser;
use gridstream_common::logging::{init_logging, LogConfig, LogLevel};
use gridstream_window::{CacheConfig, Criteria, HttpRowRangeService, SortKey, WindowCache};
use std::io::Write;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gridstream-window")]
#[command(author, version, about = "Windowed access to remote tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fetch rows [start, end] and print them as JSON lines
    Fetch {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// First row index
        #[arg(long)]
        start: u64,

        /// Last row index (inclusive)
        #[arg(long)]
        end: u64,

        /// Row-range server URL
        #[arg(long, env = "GRIDSTREAM_SERVER_URL")]
        server: Option<String>,

        /// Sort by column
        #[arg(long)]
        sort: Option<String>,

        /// Sort descending
        #[arg(long, requires = "sort")]
        descending: bool,
    },
}

async fn run_fetch(
    config: &CacheConfig,
    table: &str,
    start: u64,
    end: u64,
    sort: Option<SortKey>,
) -> Result<()> {
    let service = HttpRowRangeService::from_config(config)?;
    let cache = WindowCache::spawn(Arc::new(service), table, config);

    if let Some(sort) = sort {
        cache.set_criteria(Criteria::new(Vec::new(), vec![sort])).await?;
    }

    let window = cache
        .ensure_range(start, end)
        .await
        .with_context(|| format!("Failed to fetch rows {start}..={end} of {table}"))?;

    let mut stdout = std::io::stdout();
    for row in &window.rows {
        writeln!(stdout, "{}", serde_json::to_string(row)?)?;
    }

    let stats = cache.stats().await?;
    info!(
        rows = window.rows.len(),
        row_count = window.row_count,
        row_count_known = window.row_count_known,
        fetches = stats.fetches_issued,
        "Fetch complete"
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("gridstream-window")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let mut config = CacheConfig::from_env()?;

    match cli.command {
        Command::Fetch {
            table,
            start,
            end,
            server,
            sort,
            descending,
        } => {
            if let Some(server) = server {
                config.server_url = server;
                config.validate()?;
            }
            let sort = sort.map(|column| SortKey { column, descending });
            run_fetch(&config, &table, start, end, sort).await?;
        },
    }

    Ok(())
}
