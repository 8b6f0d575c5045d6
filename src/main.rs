//! vidpipe - Main Application Entrypoint
//!
//! Parses command-line arguments, initializes logging and dispatches to the
//! ingestion library.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;
use vidpipe::{Config, DeleteError, format_bytes, open_uploads};

/// Ingests videos, applies a frame filter and keeps a catalogue of the results.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory under which all artifacts are stored
    #[arg(long, default_value = "media")]
    storage_root: PathBuf,

    /// SQLite database holding the video records
    #[arg(long, default_value = "videos.db")]
    database: PathBuf,

    /// Number of concurrent ingestions (defaults to the number of CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds allowed for opening a video before giving up
    #[arg(long, default_value_t = 10)]
    open_timeout: u64,

    /// Extract metadata while transcoding instead of afterwards
    #[arg(long)]
    concurrent_probe: bool,

    /// Block size of the pixelate filter
    #[arg(long, default_value_t = 12)]
    pixelate_block: u32,

    /// Logging verbosity level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one or more video files
    Ingest {
        /// Video files to ingest
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Filter to apply (see `filters`)
        #[arg(short, long, default_value = "grayscale")]
        filter: String,

        /// Declared content type; guessed from the extension if omitted
        #[arg(long)]
        content_type: Option<String>,
    },
    /// List ingested videos, newest first
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record as JSON
    Show { id: Uuid },
    /// Delete a video's artifacts and record
    Delete { id: Uuid },
    /// List available filters
    Filters,
    /// Clean up ingestions that never finished
    Sweep {
        /// Only sweep ingestions started at least this many seconds ago
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn main() {
    let args = Args::parse();

    // 1. Initialize Logger
    let log_level = match args.log_level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    // 2. Create a configuration object from arguments
    let mut config = Config {
        storage_root: args.storage_root,
        database: args.database,
        open_timeout: Duration::from_secs(args.open_timeout),
        concurrent_probe: args.concurrent_probe,
        pixelate_block: args.pixelate_block,
        ..Config::default()
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    // 3. Run the requested command
    if let Err(e) = run(config, args.command) {
        error!("Command failed: {:#}", e);
        std::process::exit(2);
    }
}

fn run(config: Config, command: Command) -> Result<()> {
    match command {
        Command::Ingest { inputs, filter, content_type } => ingest(&config, inputs, &filter, content_type),
        Command::List { json } => {
            let ingestor = config.build_ingestor()?;
            let records = ingestor.list().context("Failed to list videos")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:<30} {:<10} {:>10}  {}x{}  {:>7.2}s  {}",
                    record.id,
                    record.display_name(),
                    record.filter,
                    format_bytes(record.size_bytes),
                    record.width,
                    record.height,
                    record.duration_sec,
                    record.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Command::Show { id } => {
            let ingestor = config.build_ingestor()?;
            match ingestor.get(&id).context("Failed to look up video")? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(())
                }
                None => bail!("Video {} not found", id),
            }
        }
        Command::Delete { id } => {
            let ingestor = config.build_ingestor()?;
            match ingestor.delete(&id) {
                Ok(()) => {
                    info!("Deleted video {}", id);
                    Ok(())
                }
                Err(DeleteError::NotFound(_)) => bail!("Video {} not found", id),
                Err(e) => Err(e).context("Delete did not complete"),
            }
        }
        Command::Filters => {
            for name in vidpipe::FilterRegistry::with_pixelate_block(config.pixelate_block).names() {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Sweep { older_than_secs } => {
            let ingestor = config.build_ingestor()?;
            let report = ingestor
                .sweep_pending(Duration::from_secs(older_than_secs))
                .context("Failed to read pending ingestions")?;
            info!("Swept {} stale ingestions", report.swept.len());
            for (id, e) in &report.failed {
                warn!("Could not sweep {}: {}", id, e);
            }
            if !report.failed.is_empty() {
                bail!("{} stale ingestions need manual cleanup", report.failed.len());
            }
            Ok(())
        }
    }
}

fn ingest(config: &Config, inputs: Vec<PathBuf>, filter: &str, content_type: Option<String>) -> Result<()> {
    let (ingestor, pool) = config.build_pool()?;
    if !ingestor.filters().contains(filter) {
        let known: Vec<&str> = ingestor.filters().names().collect();
        bail!("Unknown filter '{}'; available: {}", filter, known.join(", "));
    }
    info!("Ingesting {} file(s) with {} worker(s)", inputs.len(), pool.workers());

    let bars = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:<24} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .context("Invalid progress template")?
        .progress_chars("##-");

    // All inputs are opened before any job is submitted
    let uploads = open_uploads(&inputs, filter, content_type.as_deref())?;

    let mut jobs = Vec::new();
    for (input, upload) in uploads {
        let file_name = upload.file_name.clone();
        let bar = bars.add(ProgressBar::new(0));
        bar.set_style(style.clone());
        bar.set_prefix(file_name);
        bar.enable_steady_tick(Duration::from_millis(100));
        jobs.push((input, pool.submit(upload), bar));
    }

    let mut failures = 0;
    while !jobs.is_empty() {
        let mut pending = Vec::with_capacity(jobs.len());
        for (input, handle, bar) in jobs {
            let progress = handle.progress();
            bar.set_length(progress.frames_total.max(progress.frames_written));
            bar.set_position(progress.frames_written);
            bar.set_message(progress.stage.to_string());

            match handle.try_result() {
                None => pending.push((input, handle, bar)),
                Some(Ok(record)) => {
                    bar.finish_with_message(format!("done ({})", record.id));
                }
                Some(Err(e)) => {
                    failures += 1;
                    bar.abandon_with_message(format!("failed at {}", e.stage()));
                    error!("Failed to ingest {:?}: {}", input, e);
                }
            }
        }
        jobs = pending;
        std::thread::sleep(Duration::from_millis(100));
    }

    if failures > 0 {
        bail!("{} ingestion(s) failed", failures);
    }
    info!("Processing completed successfully.");
    Ok(())
}
