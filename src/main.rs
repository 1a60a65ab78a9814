use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use sqsync::sync::{
    BarProgress, FilterSet, NoProgress, ProgressReporter, RunLog, SyncConfig, SyncEngine,
    SyncOptions, SyncReport,
};

/// Log file name used when `--log` points at a directory.
const LOG_FILE_NAME: &str = "sqsync.log";

#[derive(Parser, Debug)]
#[command(name = "sqsync", version, about = "Mirror a directory tree onto another one")]
struct Cli {
    /// Test run: log what would change without modifying anything
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Delete destination entries that are not in the source
    #[arg(short, long)]
    delete: bool,

    /// Do not ask for confirmation
    #[arg(short = 'y', long = "yes")]
    yes: bool,

    /// Store copied files compressed
    #[arg(short, long)]
    compress: bool,

    /// Compare files by size and modification time instead of content hash
    #[arg(long)]
    skip_hash: bool,

    /// Ignore ownership and mode differences
    #[arg(long = "skip-mod")]
    skip_mode: bool,

    /// Exclude filter: `rx:<regex>` or a filter file (repeatable)
    #[arg(long = "filter", value_name = "rx:REGEX|FILE")]
    filters: Vec<String>,

    /// Also write the log to this file (or to sqsync.log in this directory)
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Source directory
    source: PathBuf,

    /// Destination directory
    destination: PathBuf,
}

impl Cli {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            delete: self.delete,
            dry_run: self.test,
            quiet: self.quiet,
            assume_yes: self.yes,
            compress: self.compress,
            skip_hash: self.skip_hash,
            skip_mode: self.skip_mode,
        }
    }
}

/// Open (and truncate) the log file. A directory gets `sqsync.log` inside it.
fn open_log_file(path: &Path) -> Result<File> {
    let path = if path.is_dir() {
        path.join(LOG_FILE_NAME)
    } else {
        path.to_path_buf()
    };
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file '{}'", path.display()))
}

fn init_tracing(quiet: bool, log_path: Option<&Path>) -> Result<()> {
    let default_level = if quiet { "warn" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(env_filter);

    let file_layer = match log_path {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::INFO),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn print_banner(config: &SyncConfig) {
    println!(
        "{} {}, started {}",
        "sqsync".bold(),
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    );
    println!("From: {}", config.source_root.display().to_string().cyan());
    println!("To:   {}", config.dest_root.display().to_string().cyan());
    if config.options.dry_run {
        println!("{}", "Test run, nothing will be modified".yellow());
    }
    if config.options.delete {
        println!("{}", "Entries missing from the source will be deleted".red());
    }
}

/// Ask before touching the destination. Only an explicit no aborts.
fn confirm(input: &mut impl BufRead, output: &mut impl Write) -> Result<bool> {
    write!(output, "Continue? [Y/N] ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(!matches!(line.trim().to_lowercase().as_str(), "n" | "no"))
}

fn print_summary(report: &SyncReport) {
    let stats = &report.stats;
    let heading = if report.dry_run {
        "Summary (test run)"
    } else {
        "Summary"
    };

    println!();
    println!("{}", heading.bold());
    println!("  Entries checked:   {}", stats.entries_checked);
    println!(
        "  Files copied:      {} ({})",
        stats.files_copied,
        humansize::format_size(stats.bytes_written, humansize::BINARY)
    );
    println!("  Dirs created:      {}", stats.dirs_created);
    println!("  Links created:     {}", stats.links_created);
    println!("  Entries deleted:   {}", stats.entries_deleted);
    println!("  Permissions fixed: {}", stats.permissions_fixed);
    let conflicts = report.conflict_stats();
    println!(
        "  Conflicts:         {} ({} missing in source, {} type mismatch)",
        conflicts.total(),
        conflicts.source_missing,
        conflicts.type_mismatch
    );
    println!(
        "  Elapsed:           {:.2?} ({}/s)",
        stats.elapsed(),
        humansize::format_size(stats.rate() as u64, humansize::BINARY)
    );

    let status = format!(
        "Sync finished with {} error(s), {} warning(s)",
        report.errors, report.warnings
    );
    if report.errors > 0 {
        println!("{}", status.red().bold());
    } else if report.warnings > 0 {
        println!("{}", status.yellow());
    } else {
        println!("{}", status.green());
    }
}

fn run(cli: Cli) -> Result<()> {
    let options = cli.options();

    let mut filters = FilterSet::new();
    for value in &cli.filters {
        filters.add_argument(value)?;
    }
    tracing::debug!("Loaded {} filter rule(s)", filters.len());

    let config = SyncConfig::new(&cli.source, &cli.destination, options, filters)?;

    if !options.quiet {
        print_banner(&config);
    }
    if !options.assume_yes && !confirm(&mut io::stdin().lock(), &mut io::stdout())? {
        println!("Aborted");
        return Ok(());
    }

    let mut log = RunLog::new();
    let mut progress: Box<dyn ProgressReporter> = if options.quiet {
        Box::new(NoProgress)
    } else {
        Box::new(BarProgress::new())
    };
    let report = SyncEngine::new(config, &mut log, progress.as_mut()).run()?;

    if options.quiet {
        if !report.is_clean() {
            eprintln!(
                "Sync finished with {} error(s), {} warning(s)",
                report.errors, report.warnings
            );
        }
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.quiet, cli.log.as_deref()) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
