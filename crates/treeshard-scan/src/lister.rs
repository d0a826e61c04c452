//! Phase 2: parallel file listing.
//!
//! Consumes accepted directories from Phase 1 while it is still running and
//! expands each into its immediate files on a dedicated rayon pool, sized
//! independently of Phase 1.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::debug;
use treeshard_core::ShardError;

use crate::listing::{Discovery, WalkContext};

/// Counters for a finished Phase 2.
#[derive(Debug, Clone, Default)]
pub struct ListStats {
    /// Directories listed successfully.
    pub dirs: u64,
    /// Files found.
    pub files: u64,
    /// Directories that could not be read.
    pub unreadable: u64,
    /// Wall-clock time of the phase.
    pub duration: Duration,
}

/// Parallel file lister.
pub struct FileLister<'a> {
    ctx: &'a WalkContext,
    workers: usize,
}

impl<'a> FileLister<'a> {
    /// Create a lister with `workers` threads (at least one).
    pub fn new(ctx: &'a WalkContext, workers: usize) -> Self {
        Self {
            ctx,
            workers: workers.max(1),
        }
    }

    /// List the immediate files of one directory.
    pub fn list_files(&self, dir: &Path) -> Discovery {
        let discovery = self.ctx.list(dir, true);
        if let Discovery::Listed(listing) = &discovery {
            self.ctx.progress().record_files(listing.files.len() as u64);
            debug!(path = %listing.path.display(), files = listing.files.len(), "files listed");
        }
        discovery
    }

    /// List every directory yielded by `dirs`, calling `sink` once per
    /// directory from a pool thread. Returns when `dirs` is exhausted.
    pub fn run<I, F>(&self, dirs: I, sink: F) -> Result<ListStats, ShardError>
    where
        I: Iterator<Item = PathBuf> + Send,
        F: Fn(Discovery) + Sync + Send,
    {
        let start = Instant::now();
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("list-{i}"))
            .build()
            .map_err(|e| ShardError::Worker {
                message: format!("cannot build listing pool: {e}"),
            })?;

        let listed = AtomicU64::new(0);
        let files = AtomicU64::new(0);
        let unreadable = AtomicU64::new(0);

        pool.install(|| {
            dirs.par_bridge().for_each(|dir| {
                let discovery = self.list_files(&dir);
                match &discovery {
                    Discovery::Listed(listing) => {
                        listed.fetch_add(1, Ordering::Relaxed);
                        files.fetch_add(listing.files.len() as u64, Ordering::Relaxed);
                    }
                    Discovery::Unreadable { .. } => {
                        unreadable.fetch_add(1, Ordering::Relaxed);
                    }
                }
                sink(discovery);
            });
        });

        Ok(ListStats {
            dirs: listed.load(Ordering::Relaxed),
            files: files.load(Ordering::Relaxed),
            unreadable: unreadable.load(Ordering::Relaxed),
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;
    use treeshard_core::ExclusionFilter;

    fn create_test_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        for i in 0..5 {
            fs::write(root.join(format!("a/{i}.dat")), "x").unwrap();
        }
        fs::write(root.join("b/keep.txt"), "y").unwrap();
        fs::write(root.join("b/skip.tmp"), "z").unwrap();

        temp
    }

    #[test]
    fn test_list_files_applies_filter() {
        let temp = create_test_tree();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::new(["*.tmp"]).unwrap());
        let lister = FileLister::new(&ctx, 2);

        let Discovery::Listed(listing) = lister.list_files(Path::new("b")) else {
            panic!("b should be readable");
        };
        assert_eq!(listing.file_paths(), vec![PathBuf::from("b/keep.txt")]);
        assert_eq!(ctx.progress().snapshot().files_listed, 1);
    }

    #[test]
    fn test_run_over_channel() {
        let temp = create_test_tree();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty());
        let lister = FileLister::new(&ctx, 3);

        let (tx, rx) = crossbeam_channel::unbounded();
        for dir in ["", "a", "b", "missing"] {
            tx.send(PathBuf::from(dir)).unwrap();
        }
        drop(tx);

        let collected = Mutex::new(Vec::new());
        let stats = lister.run(rx.into_iter(), |d| collected.lock().push(d)).unwrap();

        assert_eq!(stats.dirs, 3);
        assert_eq!(stats.unreadable, 1);
        assert_eq!(stats.files, 7);
        assert_eq!(collected.into_inner().len(), 4);
    }
}
