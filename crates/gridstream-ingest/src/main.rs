//! Gridstream Ingest - streaming delimited-text loader

use anyhow::{Context, Result};
use clap::Parser;
use gridstream_common::logging::{init_logging, LogConfig, LogLevel};
use gridstream_common::Row;
use gridstream_ingest::flow::{cell_count, spawn_load, BufferWatermark, LoadEvent};
use gridstream_ingest::parser::Delimiter;
use gridstream_ingest::source::{ByteSource, FileSource, HttpSource, ReaderSource};
use gridstream_ingest::IngestConfig;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gridstream-ingest")]
#[command(author, version, about = "Streaming delimited-text loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Parse a file, URL, or stdin ("-") and report what was loaded
    Parse {
        /// Path, http(s) URL, or "-" for stdin
        input: String,

        /// Rows per batch (defaults to GRIDSTREAM_BATCH_SIZE or 2000)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Field delimiter: comma, tab, or auto
        #[arg(short, long, default_value = "comma")]
        delimiter: String,

        /// Write every parsed row to stdout as a JSON array
        #[arg(long)]
        emit_rows: bool,
    },
}

async fn open_source(input: &str, config: &IngestConfig) -> Result<Box<dyn ByteSource>> {
    if input == "-" {
        return Ok(Box::new(ReaderSource::new(
            tokio::io::stdin(),
            config.read_chunk_bytes,
        )));
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        let client = reqwest::Client::new();
        let source = HttpSource::open(&client, input)
            .await
            .with_context(|| format!("Failed to open {input}"))?;
        return Ok(Box::new(source));
    }

    let source = FileSource::open(input, config.read_chunk_bytes)
        .await
        .with_context(|| format!("Failed to open {input}"))?;
    Ok(Box::new(source))
}

fn progress_bar(total: Option<u64>) -> Result<ProgressBar> {
    let pb = match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}")?
                    .progress_chars("#>-"),
            );
            pb
        },
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {bytes} {msg}")?);
            pb
        },
    };
    Ok(pb)
}

/// Writes emitted rows to stdout off the event loop.
///
/// Rows sit in the channel until stdout accepts them; the drained cell counts
/// come back so the event loop can pause the load while stdout lags.
struct RowWriter {
    rows: mpsc::UnboundedSender<Vec<Row>>,
    drained: mpsc::UnboundedReceiver<usize>,
    task: JoinHandle<Result<()>>,
}

impl RowWriter {
    fn spawn() -> Self {
        let (rows_tx, mut rows_rx) = mpsc::unbounded_channel::<Vec<Row>>();
        let (drained_tx, drained_rx) = mpsc::unbounded_channel();

        let task: JoinHandle<Result<()>> = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(rows) = rows_rx.recv().await {
                let mut buf = Vec::new();
                for row in &rows {
                    serde_json::to_writer(&mut buf, row)?;
                    buf.push(b'\n');
                }
                stdout.write_all(&buf).await.context("Failed to write rows")?;
                // The event loop stops listening once the load has finished.
                let _ = drained_tx.send(cell_count(&rows));
            }
            stdout.flush().await?;
            Ok::<_, anyhow::Error>(())
        });

        Self {
            rows: rows_tx,
            drained: drained_rx,
            task,
        }
    }

    async fn finish(self) -> Result<()> {
        drop(self.rows);
        self.task.await.context("Row writer panicked")?
    }
}

async fn drained(writer: Option<&mut RowWriter>) -> Option<usize> {
    match writer {
        Some(writer) => writer.drained.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_parse(
    input: &str,
    config: &IngestConfig,
    delimiter: Delimiter,
    emit_rows: bool,
) -> Result<()> {
    let source = open_source(input, config).await?;
    let pb = progress_bar(source.total_size())?;

    let mut load = spawn_load(source, config.parse_options(delimiter), config.flow_config());
    let mut watermark = BufferWatermark::new(config.pause_high_water_cells);
    let mut writer = emit_rows.then(RowWriter::spawn);
    let mut rows_seen = 0u64;
    let mut summary = None;

    info!(load_id = %load.load_id(), input, "Parsing");

    loop {
        let event = tokio::select! {
            event = load.next_event() => event,
            cells = drained(writer.as_mut()) => {
                let Some(cells) = cells else {
                    // The writer only stops early when stdout fails.
                    load.abort();
                    if let Some(writer) = writer.take() {
                        writer.finish().await?;
                    }
                    anyhow::bail!("Row writer stopped");
                };
                if let Some(signal) = watermark.drain(cells) {
                    load.signal(signal);
                }
                continue;
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting load");
                load.abort();
                continue;
            },
        };
        let Some(event) = event else {
            break;
        };

        match event {
            LoadEvent::Columns(columns) => {
                info!(columns = columns.len(), "Header received");
                if let Some(writer) = &writer {
                    if let Some(signal) = watermark.add(columns.len()) {
                        load.signal(signal);
                    }
                    writer.rows.send(vec![columns]).context("Row writer stopped")?;
                }
            },
            LoadEvent::Rows { batch_id, rows } => {
                rows_seen += rows.len() as u64;
                pb.set_message(format!("{rows_seen} rows"));

                if let Some(writer) = &writer {
                    if let Some(signal) = watermark.add(cell_count(&rows)) {
                        load.signal(signal);
                    }
                    writer.rows.send(rows).context("Row writer stopped")?;
                }
                load.ack(batch_id);
            },
            LoadEvent::Progress(progress) => pb.set_position(progress.loaded),
            LoadEvent::Finished(outcome) => {
                pb.finish_and_clear();
                summary = Some(outcome.context("Load failed")?);
                break;
            },
        }
    }

    if let Some(writer) = writer {
        writer.finish().await?;
    }

    if let Some(summary) = summary {
        info!(
            rows = summary.rows,
            batches = summary.batches,
            ragged_rows = summary.ragged_rows,
            unterminated_quote = summary.unterminated_quote,
            "Parse complete"
        );
        if !emit_rows {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

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
        .log_file_prefix("gridstream-ingest")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;

    match cli.command {
        Command::Parse {
            input,
            batch_size,
            delimiter,
            emit_rows,
        } => {
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
                config.validate()?;
            }
            let delimiter: Delimiter = delimiter.parse()?;
            run_parse(&input, &config, delimiter, emit_rows).await?;
        },
    }

    Ok(())
}
