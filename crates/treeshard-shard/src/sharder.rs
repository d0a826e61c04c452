//! Run orchestration: walk, assign, write.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tracing::{debug, info};
use treeshard_core::{
    ExclusionFilter, PathUnit, Placement, RunConfig, ShardError, ShardMode, WeightStrategy,
};
use treeshard_scan::{
    DirectoryEnumerator, Discovery, FileLister, ProgressTracker, WalkContext, WalkProgress,
};

use crate::assign::{Balance, ShardAssigner};
use crate::writer::{ShardOutput, ShardWriter, StagedShards};

/// Name of the run summary written next to the shard files.
pub const SUMMARY_FILE: &str = "summary.json";

/// Wall-clock time per stage, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub phase1_secs: f64,
    pub phase2_secs: f64,
    pub write_secs: f64,
    pub total_secs: f64,
}

/// Outcome of a finished run. Also written as `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Resolved walk root.
    pub root: PathBuf,
    pub outdir: PathBuf,
    pub mode: ShardMode,
    pub shards: usize,
    pub weight: WeightStrategy,
    pub placement: Placement,
    pub generated_at: DateTime<Utc>,
    /// One entry per shard, index order.
    pub outputs: Vec<ShardOutput>,
    /// Accepted directories listed, root included.
    pub dirs: u64,
    /// Files listed across all accepted directories.
    pub files: u64,
    /// Units assigned.
    pub units: u64,
    /// Recoverable errors met during the walk.
    pub warnings: u64,
    pub balance: Balance,
    pub timings: Timings,
}

impl RunReport {
    /// Total number of paths written.
    pub fn total_paths(&self) -> usize {
        self.outputs.iter().map(|o| o.paths).sum()
    }

    /// Sum of all shard weights.
    pub fn total_weight(&self) -> u64 {
        self.outputs.iter().map(|o| o.total_weight).sum()
    }
}

struct WalkOutcome {
    dirs: u64,
    phase1: Duration,
    phase2: Duration,
}

/// Partitions one tree into shard files.
pub struct Sharder {
    config: RunConfig,
    progress_tx: broadcast::Sender<WalkProgress>,
}

impl Sharder {
    /// Create a sharder. The config is checked here, before anything
    /// touches the filesystem.
    pub fn new(config: RunConfig) -> Result<Self, ShardError> {
        config.validate()?;
        Ok(Self {
            config,
            progress_tx: ProgressTracker::channel(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Subscribe to progress snapshots published during [`run`](Self::run).
    pub fn subscribe(&self) -> broadcast::Receiver<WalkProgress> {
        self.progress_tx.subscribe()
    }

    /// Walk the tree, assign every unit and write the N shard files.
    ///
    /// Every call starts from zeroed counters. The shard files, their logs,
    /// the summary and the optional directory manifest are staged first and
    /// renamed into place together; a failed run leaves the previous output
    /// untouched.
    pub fn run(&self) -> Result<RunReport, ShardError> {
        let start = Instant::now();
        let progress = Arc::new(ProgressTracker::with_sender(self.progress_tx.clone()));
        let filter = ExclusionFilter::new(&self.config.exclude)?;
        let root = resolve_root(&self.config.root)?;
        probe_outdir(&self.config.outdir)?;

        info!(
            root = %root.display(),
            shards = self.config.shards,
            mode = %self.config.mode,
            weight = %self.config.weight,
            placement = %self.config.placement,
            "starting run"
        );

        let ctx = WalkContext::new(&root, filter)
            .with_weight(self.config.weight)
            .with_follow_symlinks(self.config.follow_symlinks)
            .with_progress(Arc::clone(&progress));
        let assigner = ShardAssigner::new(self.config.shards)?;
        let held = Mutex::new(Vec::new());
        let manifest = self.config.dirs_out.as_ref().map(|_| Mutex::new(Vec::new()));
        let note_dir = |path: &Path| {
            if let Some(manifest) = &manifest {
                manifest.lock().push(path.to_path_buf());
            }
        };

        let deliver = |unit: PathUnit| {
            progress.record_unit();
            let errors = unit.error_count();
            if errors > 0 {
                progress.record_errors(errors as u64);
            }
            match self.config.placement {
                Placement::Streaming => {
                    assigner.assign(unit);
                }
                Placement::Sorted => held.lock().push(unit),
            }
        };

        let walk = match self.config.mode {
            ShardMode::ByDir => self.walk_by_dir(&ctx, &deliver, &note_dir)?,
            ShardMode::ByFile => self.walk_by_file(&ctx, &deliver, &note_dir)?,
        };

        if self.config.placement == Placement::Sorted {
            assigner.assign_sorted(held.into_inner());
        }
        let balance = assigner.balance();
        info!(
            dirs = walk.dirs,
            max = balance.max_total,
            min = balance.min_total,
            spread = balance.spread,
            "assignment complete"
        );

        let write_start = Instant::now();
        let buckets = assigner.into_buckets();
        let writer = ShardWriter::new(&self.config, &root);
        let mut staged = writer.stage(&buckets)?;
        let write = write_start.elapsed();

        let counts = progress.snapshot();
        let report = RunReport {
            root: root.clone(),
            outdir: self.config.outdir.clone(),
            mode: self.config.mode,
            shards: self.config.shards,
            weight: self.config.weight,
            placement: self.config.placement,
            generated_at: Utc::now(),
            files: counts.files_listed,
            outputs: staged.outputs().to_vec(),
            dirs: walk.dirs,
            units: counts.units_assigned,
            warnings: counts.errors,
            balance,
            timings: Timings {
                phase1_secs: walk.phase1.as_secs_f64(),
                phase2_secs: walk.phase2.as_secs_f64(),
                write_secs: write.as_secs_f64(),
                total_secs: start.elapsed().as_secs_f64(),
            },
        };

        stage_summary(&mut staged, &self.config.outdir, &report)?;
        if let (Some(path), Some(manifest)) = (self.config.dirs_manifest_path(), manifest) {
            stage_manifest(&mut staged, &path, manifest.into_inner())?;
        }
        writer.commit(staged)?;
        progress.publish();
        info!(
            paths = report.total_paths(),
            elapsed_secs = report.timings.total_secs,
            "run complete"
        );
        Ok(report)
    }

    /// Phase 1 only: every accepted directory becomes one bundle unit.
    fn walk_by_dir<F, D>(
        &self,
        ctx: &WalkContext,
        deliver: &F,
        note_dir: &D,
    ) -> Result<WalkOutcome, ShardError>
    where
        F: Fn(PathUnit) + Sync,
        D: Fn(&Path) + Sync,
    {
        let weight = ctx.weight();
        let stats = DirectoryEnumerator::new(ctx, self.config.phase1_workers())
            .collect_files(true)
            .enumerate(|discovery| {
                note_dir(discovery.path());
                if let Discovery::Listed(listing) = &discovery {
                    ctx.progress().record_files(listing.files.len() as u64);
                }
                deliver(bundle_unit(discovery, weight));
            })?;

        info!(
            dirs = stats.dirs,
            unreadable = stats.unreadable,
            elapsed_secs = stats.duration.as_secs_f64(),
            "directory enumeration complete"
        );
        Ok(WalkOutcome {
            dirs: stats.dirs,
            phase1: stats.duration,
            phase2: Duration::ZERO,
        })
    }

    /// Both phases at once: Phase 1 feeds accepted directories through a
    /// bounded channel to the Phase 2 pool, which emits one unit per file.
    fn walk_by_file<F, D>(
        &self,
        ctx: &WalkContext,
        deliver: &F,
        note_dir: &D,
    ) -> Result<WalkOutcome, ShardError>
    where
        F: Fn(PathUnit) + Sync,
        D: Fn(&Path) + Sync,
    {
        let weight = ctx.weight();
        let (tx, rx) = crossbeam_channel::bounded::<PathBuf>(self.config.max_queue);
        let workers1 = self.config.phase1_workers();
        let workers2 = self.config.phase2_workers();

        let (enumerated, listed) = thread::scope(|scope| {
            let producer = thread::Builder::new()
                .name("phase1".to_string())
                .spawn_scoped(scope, move || {
                    DirectoryEnumerator::new(ctx, workers1)
                        .collect_files(false)
                        .enumerate(|discovery| {
                            note_dir(discovery.path());
                            match discovery {
                                Discovery::Listed(listing) => {
                                    if !listing.warnings.is_empty() {
                                        // Phase 2 lists the directory again and reports them.
                                        debug!(
                                            path = %listing.path.display(),
                                            warnings = listing.warnings.len(),
                                            "enumeration warnings"
                                        );
                                    }
                                    // Only fails once Phase 2 has gone away.
                                    let _ = tx.send(listing.path);
                                }
                                Discovery::Unreadable { path, warning } => {
                                    deliver(PathUnit::unreadable(path, warning));
                                }
                            }
                        })
                })
                .map_err(|e| ShardError::Worker {
                    message: format!("cannot spawn enumeration thread: {e}"),
                })?;

            let listed = FileLister::new(ctx, workers2).run(rx.into_iter(), |discovery| {
                for unit in file_units(discovery, weight) {
                    deliver(unit);
                }
            });
            let enumerated = producer.join().map_err(|_| ShardError::Worker {
                message: "enumeration thread panicked".to_string(),
            })?;
            Ok::<_, ShardError>((enumerated?, listed?))
        })?;

        info!(
            dirs = enumerated.dirs,
            unreadable = enumerated.unreadable,
            elapsed_secs = enumerated.duration.as_secs_f64(),
            "directory enumeration complete"
        );
        info!(
            dirs = listed.dirs,
            files = listed.files,
            unreadable = listed.unreadable,
            elapsed_secs = listed.duration.as_secs_f64(),
            "file listing complete"
        );
        Ok(WalkOutcome {
            dirs: enumerated.dirs,
            phase1: enumerated.duration,
            phase2: listed.duration,
        })
    }
}

fn bundle_unit(discovery: Discovery, weight: WeightStrategy) -> PathUnit {
    match discovery {
        Discovery::Listed(listing) => {
            let unit_weight = listing.weight(weight);
            let files = listing.file_paths();
            PathUnit::bundle(listing.path, files, unit_weight).with_warnings(listing.warnings)
        }
        Discovery::Unreadable { path, warning } => PathUnit::unreadable(path, warning),
    }
}

fn file_units(discovery: Discovery, weight: WeightStrategy) -> Vec<PathUnit> {
    match discovery {
        Discovery::Listed(listing) => {
            let mut units = Vec::with_capacity(listing.files.len() + 1);
            units.push(PathUnit::directory(listing.path).with_warnings(listing.warnings));
            units.extend(listing.files.into_iter().map(|file| {
                let file_weight = file.weight(weight);
                PathUnit::file(file.path, file_weight)
            }));
            units
        }
        Discovery::Unreadable { path, warning } => vec![PathUnit::unreadable(path, warning)],
    }
}

/// Canonicalize the root and make sure it is a readable directory.
fn resolve_root(root: &Path) -> Result<PathBuf, ShardError> {
    let resolved = fs::canonicalize(root).map_err(|e| ShardError::io(root, e))?;
    if !resolved.is_dir() {
        return Err(ShardError::NotADirectory { path: resolved });
    }
    fs::read_dir(&resolved).map_err(|e| ShardError::io(&resolved, e))?;
    Ok(resolved)
}

/// Create the output directory and check that it accepts files, so an
/// unwritable target fails before the walk instead of after it.
fn probe_outdir(outdir: &Path) -> Result<(), ShardError> {
    fs::create_dir_all(outdir).map_err(|e| ShardError::io(outdir, e))?;
    NamedTempFile::new_in(outdir).map_err(|e| ShardError::io(outdir, e))?;
    Ok(())
}

/// Stage the run summary so it lands together with the shard files.
fn stage_summary(
    staged: &mut StagedShards,
    outdir: &Path,
    report: &RunReport,
) -> Result<(), ShardError> {
    let path = outdir.join(SUMMARY_FILE);
    let io_err = |e: std::io::Error| ShardError::io(&path, e);

    let json = serde_json::to_vec_pretty(report).map_err(|e| io_err(e.into()))?;
    let mut file = NamedTempFile::new_in(outdir).map_err(io_err)?;
    file.write_all(&json).map_err(io_err)?;
    file.write_all(b"\n").map_err(io_err)?;
    staged.add(file, path);
    Ok(())
}

/// Stage the directory manifest: every accepted directory relative to root,
/// sorted, NUL-terminated, with the root itself written as `.`.
fn stage_manifest(
    staged: &mut StagedShards,
    path: &Path,
    mut dirs: Vec<PathBuf>,
) -> Result<(), ShardError> {
    let io_err = |e: std::io::Error| ShardError::io(path, e);
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(io_err)?;

    dirs.sort();
    let file = NamedTempFile::new_in(parent).map_err(io_err)?;
    {
        let mut out = BufWriter::new(file.as_file());
        for dir in &dirs {
            if dir.as_os_str().is_empty() {
                out.write_all(b".").map_err(io_err)?;
            } else {
                out.write_all(dir.as_os_str().as_encoded_bytes()).map_err(io_err)?;
            }
            out.write_all(b"\0").map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;
    }
    debug!(path = %path.display(), dirs = dirs.len(), "directory manifest staged");
    staged.add(file, path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_zero_shards_rejected_before_walk() {
        let config = RunConfig::new("/does/not/exist", "/also/missing", 0);
        assert!(matches!(
            Sharder::new(config),
            Err(ShardError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_root_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain.txt");
        fs::write(&file, "x").unwrap();

        let sharder = Sharder::new(RunConfig::new(&file, temp.path().join("out"), 2)).unwrap();
        assert!(matches!(
            sharder.run(),
            Err(ShardError::NotADirectory { .. })
        ));
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_file_units_lead_with_directory() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("d")).unwrap();
        fs::write(temp.path().join("d/1"), "x").unwrap();
        fs::write(temp.path().join("d/2"), "y").unwrap();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty());

        let units = file_units(ctx.list(Path::new("d"), true), WeightStrategy::Files);
        let kinds: Vec<_> = units.iter().map(|u| (u.path.clone(), u.weight)).collect();
        assert_eq!(
            kinds,
            vec![
                (PathBuf::from("d"), 0),
                (PathBuf::from("d/1"), 1),
                (PathBuf::from("d/2"), 1),
            ]
        );
    }
}
