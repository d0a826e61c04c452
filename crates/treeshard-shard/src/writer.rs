//! Shard file persistence.
//!
//! Every shard file and its log are first written to temporary files in the
//! output directory and only renamed into place once all N have been
//! written. Files from a previous run are moved aside during the renames and
//! restored if one fails, so a failed run leaves the previous partition (or
//! nothing) behind.

use std::borrow::Cow;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};
use treeshard_core::{PathStyle, RunConfig, ShardError};

use crate::assign::ShardBucket;

/// A persisted shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOutput {
    /// Shard index in `[0, N)`.
    pub index: usize,
    /// Path list file.
    pub path: PathBuf,
    /// Companion log file.
    pub log_path: PathBuf,
    /// Units assigned.
    pub units: usize,
    /// Paths written.
    pub paths: usize,
    /// Sum of unit weights.
    pub total_weight: u64,
    /// Recoverable errors attributed to this shard.
    pub errors: usize,
}

/// Writes buckets to numbered shard files.
pub struct ShardWriter<'a> {
    config: &'a RunConfig,
    root: &'a Path,
}

/// A file written to a temporary name, waiting to be renamed into place.
struct Pending {
    file: NamedTempFile,
    target: PathBuf,
    /// Shard the file belongs to; `None` for run-level files.
    index: Option<usize>,
}

/// Shard files written to temporary names in the output directory.
///
/// Dropping it without [`ShardWriter::commit`] removes every staged file
/// and leaves the output directory as it was.
pub struct StagedShards {
    outputs: Vec<ShardOutput>,
    pending: Vec<Pending>,
}

impl StagedShards {
    /// Outputs as they will be once committed.
    pub fn outputs(&self) -> &[ShardOutput] {
        &self.outputs
    }

    /// Stage a run-level file (the summary or the directory manifest) to be
    /// committed together with the shards. `file` must live on the same
    /// filesystem as `target`.
    pub fn add(&mut self, file: NamedTempFile, target: impl Into<PathBuf>) {
        self.pending.push(Pending {
            file,
            target: target.into(),
            index: None,
        });
    }
}

/// A committed file and the previous file it replaced, if any.
struct Swapped {
    target: PathBuf,
    backup: Option<TempPath>,
}

impl<'a> ShardWriter<'a> {
    /// `root` is the resolved walk root used to build absolute paths.
    pub fn new(config: &'a RunConfig, root: &'a Path) -> Self {
        Self { config, root }
    }

    /// Final path of shard `index`.
    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.config.outdir.join(self.config.shard_file_name(index))
    }

    /// Final path of the log of shard `index`.
    pub fn log_path(&self, index: usize) -> PathBuf {
        self.config.outdir.join(self.config.shard_log_name(index))
    }

    /// Write every bucket; bucket `i` becomes shard `i`.
    pub fn flush(&self, buckets: &[ShardBucket]) -> Result<Vec<ShardOutput>, ShardError> {
        let staged = self.stage(buckets)?;
        self.commit(staged)
    }

    /// Write every bucket to a temporary file without touching the final
    /// names.
    pub fn stage(&self, buckets: &[ShardBucket]) -> Result<StagedShards, ShardError> {
        let outdir = &self.config.outdir;
        fs::create_dir_all(outdir).map_err(|e| ShardError::io(outdir, e))?;

        let mut staged = StagedShards {
            outputs: Vec::with_capacity(buckets.len()),
            pending: Vec::with_capacity(buckets.len() * 2),
        };
        for (index, bucket) in buckets.iter().enumerate() {
            let (output, list, log) = self.stage_shard(index, bucket)?;
            staged.pending.push(Pending {
                file: list,
                target: output.path.clone(),
                index: Some(index),
            });
            staged.pending.push(Pending {
                file: log,
                target: output.log_path.clone(),
                index: Some(index),
            });
            staged.outputs.push(output);
        }
        Ok(staged)
    }

    /// Rename every staged file into place.
    ///
    /// Files already at the final names are moved aside first. If any rename
    /// fails, the new files are removed and the previous ones restored, so the
    /// output directory holds either the whole new partition or the old one.
    pub fn commit(&self, staged: StagedShards) -> Result<Vec<ShardOutput>, ShardError> {
        let StagedShards { outputs, pending } = staged;
        let mut swapped: Vec<Swapped> = Vec::with_capacity(pending.len());

        for Pending {
            file,
            target,
            index,
        } in pending
        {
            if let Err(source) = self.swap_in(file, &target, &mut swapped) {
                rollback(swapped);
                return Err(match index {
                    Some(index) => ShardError::ShardWrite {
                        index,
                        path: target,
                        source,
                    },
                    None => ShardError::io(target, source),
                });
            }
        }

        // Success: dropping the backups deletes the previous run's files.
        drop(swapped);
        for output in &outputs {
            debug!(index = output.index, paths = output.paths, "shard written");
        }
        Ok(outputs)
    }

    fn swap_in(
        &self,
        file: NamedTempFile,
        target: &Path,
        swapped: &mut Vec<Swapped>,
    ) -> std::io::Result<()> {
        let backup = if target.exists() {
            let dir = target.parent().unwrap_or(self.config.outdir.as_path());
            let backup = NamedTempFile::new_in(dir)?.into_temp_path();
            fs::rename(target, &backup)?;
            Some(backup)
        } else {
            None
        };

        match file.persist(target) {
            Ok(_) => {
                swapped.push(Swapped {
                    target: target.to_path_buf(),
                    backup,
                });
                Ok(())
            }
            Err(err) => {
                if let Some(backup) = backup {
                    let _ = backup.persist(target);
                }
                Err(err.error)
            }
        }
    }

    fn stage_shard(
        &self,
        index: usize,
        bucket: &ShardBucket,
    ) -> Result<(ShardOutput, NamedTempFile, NamedTempFile), ShardError> {
        let path = self.shard_path(index);
        let log_path = self.log_path(index);
        let write_err = |source: std::io::Error| ShardError::ShardWrite {
            index,
            path: path.clone(),
            source,
        };

        let list = NamedTempFile::new_in(&self.config.outdir).map_err(&write_err)?;
        let paths = self.write_paths(list.as_file(), bucket).map_err(&write_err)?;

        let output = ShardOutput {
            index,
            path: path.clone(),
            log_path,
            units: bucket.units.len(),
            paths,
            total_weight: bucket.total_weight,
            errors: bucket.error_count(),
        };

        let log = NamedTempFile::new_in(&self.config.outdir).map_err(&write_err)?;
        self.write_log(log.as_file(), &output, bucket).map_err(&write_err)?;

        Ok((output, list, log))
    }

    fn write_paths(&self, file: &fs::File, bucket: &ShardBucket) -> std::io::Result<usize> {
        let delimiter = self.config.delimiter.byte();
        let mut out = BufWriter::with_capacity(1024 * 1024, file);
        let mut count = 0;

        for unit in &bucket.units {
            for rel in unit.paths() {
                let bytes = match self.config.path_style {
                    PathStyle::Absolute => path_bytes(&self.root.join(rel)).into_owned(),
                    PathStyle::Relative => path_bytes(rel).into_owned(),
                };
                if bytes.contains(&delimiter) {
                    warn!(path = %rel.display(), "path contains the record separator; use NUL delimiters");
                }
                out.write_all(&bytes)?;
                out.write_all(&[delimiter])?;
                count += 1;
            }
        }

        out.flush()?;
        Ok(count)
    }

    fn write_log(
        &self,
        file: &fs::File,
        output: &ShardOutput,
        bucket: &ShardBucket,
    ) -> std::io::Result<()> {
        let mut out = BufWriter::new(file);
        writeln!(out, "shard: {} of {}", output.index, self.config.shards)?;
        writeln!(out, "file: {}", output.path.display())?;
        writeln!(out, "units: {}", output.units)?;
        writeln!(out, "paths: {}", output.paths)?;
        writeln!(out, "total_weight: {}", output.total_weight)?;
        writeln!(out, "errors: {}", output.errors)?;
        for warning in bucket.units.iter().flat_map(|u| &u.warnings) {
            writeln!(
                out,
                "{:?}\t{}\t{}",
                warning.kind,
                warning.path.display(),
                warning.message
            )?;
        }
        out.flush()
    }
}

/// Undo committed renames, newest first.
fn rollback(swapped: Vec<Swapped>) {
    for Swapped { target, backup } in swapped.into_iter().rev() {
        let _ = fs::remove_file(&target);
        if let Some(backup) = backup {
            if let Err(err) = backup.persist(&target) {
                warn!(path = %target.display(), error = %err.error, "cannot restore previous file");
            }
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Cow<'_, [u8]> {
    match path.to_string_lossy() {
        Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    }
}
