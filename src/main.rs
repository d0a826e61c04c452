//! treeshard - split a directory tree into N balanced path lists.
//!
//! Usage:
//!   treeshard --root PATH --outdir DIR --shards N          One shard per job
//!   treeshard ... --mode byfile --weight bytes             Balance single files by size
//!   treeshard --config run.toml --shards 128               File defaults, CLI overrides
//!   treeshard --help                                       Show help

use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use treeshard_core::{
    Delimiter, PathStyle, Placement, RunConfig, RunConfigBuilder, ShardMode, WeightStrategy,
};
use treeshard_shard::{RunReport, Sharder};

#[derive(Parser)]
#[command(
    name = "treeshard",
    version,
    about = "Split a file tree into N balanced shard files",
    long_about = "treeshard walks a directory tree in parallel and writes N path lists \
                  of roughly equal weight, one per downstream job.\n\n\
                  Shard i is written to <outdir>/<prefix>_<i:05>.txt (or .nul), so a \
                  job array task can find its list from its index alone."
)]
struct Cli {
    /// Root of the tree to partition
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory receiving the shard files
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Number of shards
    #[arg(short = 'n', long)]
    shards: Option<usize>,

    /// Balancing unit: whole directories or single files
    #[arg(long)]
    mode: Option<ShardMode>,

    /// Directory enumeration threads (0 = all cores)
    #[arg(long)]
    workers1: Option<usize>,

    /// File listing threads (0 = all cores)
    #[arg(long)]
    workers2: Option<usize>,

    /// Entry name or glob to skip together with its subtree (repeatable)
    #[arg(short, long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Unit weight: files, bytes or uniform
    #[arg(long)]
    weight: Option<WeightStrategy>,

    /// Placement: streaming (as discovered) or sorted (heaviest first)
    #[arg(long)]
    placement: Option<Placement>,

    /// Write paths relative to the root
    #[arg(long)]
    relative: bool,

    /// Terminate paths with NUL instead of newline
    #[arg(long)]
    nul: bool,

    /// Descend into symlinked directories
    #[arg(long)]
    follow_symlinks: bool,

    /// Capacity of the queue between the two walk phases
    #[arg(long)]
    max_queue: Option<usize>,

    /// Shard file name prefix
    #[arg(long = "prefix")]
    prefix: Option<String>,

    /// Also write every accepted directory (NUL-separated, relative) here;
    /// relative paths land under the output directory
    #[arg(long, value_name = "PATH")]
    dirs_out: Option<PathBuf>,

    /// TOML file with run settings; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print progress to stderr while walking
    #[arg(long)]
    progress: bool,

    /// Summary format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = build_config(&cli)?;
    let sharder = Sharder::new(config).context("Invalid configuration")?;

    let reporter = cli.progress.then(|| {
        let mut rx = sharder.subscribe();
        thread::spawn(move || {
            loop {
                match rx.blocking_recv() {
                    Ok(p) => eprintln!(
                        "  {} dirs, {} files, {} units, {} errors ({:.0} files/s)",
                        p.dirs_discovered,
                        p.files_listed,
                        p.units_assigned,
                        p.errors,
                        p.files_per_second()
                    ),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let result = sharder.run();
    drop(sharder);
    if let Some(handle) = reporter {
        let _ = handle.join();
    }
    let report = result.context("Run failed")?;

    match cli.format {
        OutputFormat::Text => print_summary(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("treeshard=debug,warn")
    } else {
        EnvFilter::new("treeshard=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Merge the optional config file with command-line flags.
fn build_config(cli: &Cli) -> Result<RunConfig> {
    let mut builder = match &cli.config {
        Some(path) => RunConfigBuilder::from(
            RunConfig::from_toml_file(path).context("Cannot load config file")?,
        ),
        None => RunConfig::builder(),
    };

    if let Some(root) = &cli.root {
        builder.root(root.clone());
    }
    if let Some(outdir) = &cli.outdir {
        builder.outdir(outdir.clone());
    }
    if let Some(shards) = cli.shards {
        builder.shards(shards);
    }
    if let Some(mode) = cli.mode {
        builder.mode(mode);
    }
    if let Some(workers) = cli.workers1 {
        builder.workers1(workers);
    }
    if let Some(workers) = cli.workers2 {
        builder.workers2(workers);
    }
    if !cli.exclude.is_empty() {
        builder.exclude(cli.exclude.clone());
    }
    if let Some(weight) = cli.weight {
        builder.weight(weight);
    }
    if let Some(placement) = cli.placement {
        builder.placement(placement);
    }
    if cli.relative {
        builder.path_style(PathStyle::Relative);
    }
    if cli.nul {
        builder.delimiter(Delimiter::Nul);
    }
    if cli.follow_symlinks {
        builder.follow_symlinks(true);
    }
    if let Some(max_queue) = cli.max_queue {
        builder.max_queue(max_queue);
    }
    if let Some(prefix) = &cli.prefix {
        builder.file_prefix(prefix.clone());
    }
    if let Some(dirs_out) = &cli.dirs_out {
        builder.dirs_out(dirs_out.clone());
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(report: &RunReport) {
    println!();
    println!("{}", "─".repeat(60));
    println!(" {} -> {}", report.root.display(), report.outdir.display());
    println!(
        " {} shards, mode {}, weight {}, placement {}",
        report.shards, report.mode, report.weight, report.placement
    );
    println!(
        " {} directories, {} files, {} paths written",
        report.dirs,
        report.files,
        report.total_paths()
    );
    println!(
        " Walked in {:.2}s, written in {:.2}s",
        report.timings.phase1_secs.max(report.timings.phase2_secs),
        report.timings.write_secs
    );
    println!("{}", "─".repeat(60));
    println!();

    println!(
        " Balance: max {}, min {}, spread {} (largest unit {})",
        format_weight(report, report.balance.max_total),
        format_weight(report, report.balance.min_total),
        format_weight(report, report.balance.spread),
        format_weight(report, report.balance.largest_unit)
    );

    let errors: usize = report.outputs.iter().map(|o| o.errors).sum();
    if errors > 0 {
        println!();
        println!(" {} error(s) during walk, see the shard logs", errors);
    }
}

/// Format a weight in the unit of the run's weight strategy.
fn format_weight(report: &RunReport, weight: u64) -> String {
    match report.weight {
        WeightStrategy::Bytes => humansize::format_size(weight, humansize::BINARY),
        WeightStrategy::Files => format!("{weight} files"),
        WeightStrategy::Uniform => format!("{weight} units"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "treeshard",
            "--root",
            "/data",
            "--outdir",
            "/out",
            "-n",
            "8",
            "--mode",
            "byfile",
            "--weight",
            "bytes",
            "--exclude",
            ".snapshot",
            "--nul",
            "--relative",
            "--dirs-out",
            "dirs.nul",
        ]);
        let config = build_config(&cli).unwrap();

        assert_eq!(config.shards, 8);
        assert_eq!(config.mode, ShardMode::ByFile);
        assert_eq!(config.weight, WeightStrategy::Bytes);
        assert_eq!(config.exclude, vec![".snapshot".to_string()]);
        assert_eq!(config.delimiter, Delimiter::Nul);
        assert_eq!(config.path_style, PathStyle::Relative);
        assert_eq!(config.dirs_manifest_path(), Some(PathBuf::from("/out/dirs.nul")));
    }

    #[test]
    fn test_config_file_with_override() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(
            &path,
            "root = \"/data\"\noutdir = \"/out\"\nshards = 4\nweight = \"uniform\"\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "treeshard",
            "--config",
            path.to_str().unwrap(),
            "--shards",
            "16",
        ]);
        let config = build_config(&cli).unwrap();

        assert_eq!(config.shards, 16);
        assert_eq!(config.weight, WeightStrategy::Uniform);
        assert_eq!(config.root, PathBuf::from("/data"));
    }

    #[test]
    fn test_missing_shards_is_rejected() {
        let cli = Cli::parse_from(["treeshard", "--root", "/data", "--outdir", "/out"]);
        assert!(build_config(&cli).is_err());
    }
}
