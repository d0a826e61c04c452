//! Phase 1: parallel directory discovery.
//!
//! ```text
//! work queue (crossbeam, FIFO)
//! │
//! ├── enumerate-0: pop dir → list → push subdirs → emit discovery
//! ├── enumerate-1: pop dir → list → push subdirs → emit discovery
//! └── enumerate-N: ...
//! ```
//!
//! Termination uses an in-flight counter: a directory is counted when it is
//! queued and released after its subdirectories have been queued, so the
//! counter reaches zero only once the queue is drained and every worker is
//! idle. The worker that releases the last directory sends one stop message
//! per worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;
use treeshard_core::ShardError;

use crate::listing::{Discovery, WalkContext};

enum Task {
    Dir(PathBuf),
    Stop,
}

/// Counters for a finished Phase 1.
#[derive(Debug, Clone, Default)]
pub struct EnumerateStats {
    /// Directories listed successfully, root included.
    pub dirs: u64,
    /// Directories that could not be read.
    pub unreadable: u64,
    /// Wall-clock time of the phase.
    pub duration: Duration,
}

/// Parallel directory enumerator.
pub struct DirectoryEnumerator<'a> {
    ctx: &'a WalkContext,
    workers: usize,
    collect_files: bool,
}

impl<'a> DirectoryEnumerator<'a> {
    /// Create an enumerator with `workers` threads (at least one).
    pub fn new(ctx: &'a WalkContext, workers: usize) -> Self {
        Self {
            ctx,
            workers: workers.max(1),
            collect_files: true,
        }
    }

    /// Whether each discovery carries the directory's files. Off when a
    /// second phase lists them instead.
    pub fn collect_files(mut self, collect: bool) -> Self {
        self.collect_files = collect;
        self
    }

    /// Walk the whole tree below the context root.
    ///
    /// `sink` is called once per accepted directory, root included, from the
    /// worker thread that listed it. Discovery order is unspecified.
    pub fn enumerate<F>(&self, sink: F) -> Result<EnumerateStats, ShardError>
    where
        F: Fn(Discovery) + Sync,
    {
        let start = Instant::now();
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let in_flight = AtomicUsize::new(1);
        let dirs = AtomicU64::new(0);
        let unreadable = AtomicU64::new(0);

        // The receiver is alive, so this cannot fail.
        let _ = tx.send(Task::Dir(PathBuf::new()));

        thread::scope(|scope| -> Result<(), ShardError> {
            let mut handles = Vec::with_capacity(self.workers);
            for id in 0..self.workers {
                let tx = tx.clone();
                let rx = rx.clone();
                let shared = Shared {
                    in_flight: &in_flight,
                    dirs: &dirs,
                    unreadable: &unreadable,
                };
                let sink = &sink;
                let handle = thread::Builder::new()
                    .name(format!("enumerate-{id}"))
                    .spawn_scoped(scope, move || self.worker_loop(id, &tx, &rx, shared, sink))
                    .map_err(|e| ShardError::Worker {
                        message: format!("cannot spawn enumerator thread: {e}"),
                    })?;
                handles.push(handle);
            }

            let panicked = handles
                .into_iter()
                .map(|handle| handle.join())
                .filter(Result::is_err)
                .count();
            if panicked > 0 {
                return Err(ShardError::Worker {
                    message: format!("{panicked} enumerator thread(s) panicked"),
                });
            }
            Ok(())
        })?;

        Ok(EnumerateStats {
            dirs: dirs.load(Ordering::Relaxed),
            unreadable: unreadable.load(Ordering::Relaxed),
            duration: start.elapsed(),
        })
    }

    fn worker_loop<F>(
        &self,
        id: usize,
        tx: &Sender<Task>,
        rx: &Receiver<Task>,
        shared: Shared<'_>,
        sink: &F,
    ) where
        F: Fn(Discovery) + Sync,
    {
        let _guard = StopOnPanic {
            tx,
            workers: self.workers,
        };
        debug!(worker = id, "enumerator started");

        while let Ok(Task::Dir(rel)) = rx.recv() {
            let discovery = self.ctx.list(&rel, self.collect_files);

            match &discovery {
                Discovery::Listed(listing) => {
                    shared
                        .in_flight
                        .fetch_add(listing.subdirs.len(), Ordering::SeqCst);
                    for subdir in &listing.subdirs {
                        let _ = tx.send(Task::Dir(subdir.clone()));
                    }
                    shared.dirs.fetch_add(1, Ordering::Relaxed);
                    self.ctx.progress().record_dir();
                    debug!(
                        worker = id,
                        path = %listing.path.display(),
                        subdirs = listing.subdirs.len(),
                        files = listing.files.len(),
                        "directory listed"
                    );
                }
                Discovery::Unreadable { .. } => {
                    shared.unreadable.fetch_add(1, Ordering::Relaxed);
                }
            }

            sink(discovery);

            if shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                for _ in 0..self.workers {
                    let _ = tx.send(Task::Stop);
                }
            }
        }

        debug!(worker = id, "enumerator finished");
    }
}

#[derive(Clone, Copy)]
struct Shared<'s> {
    in_flight: &'s AtomicUsize,
    dirs: &'s AtomicU64,
    unreadable: &'s AtomicU64,
}

/// Releases the other workers if this one unwinds, so a panic surfaces as an
/// error from `enumerate` instead of a hang.
struct StopOnPanic<'t> {
    tx: &'t Sender<Task>,
    workers: usize,
}

impl Drop for StopOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            for _ in 0..self.workers {
                let _ = self.tx.send(Task::Stop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use treeshard_core::ExclusionFilter;

    fn create_test_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("d")).unwrap();
        fs::create_dir_all(root.join("a/.snapshot/hourly")).unwrap();
        fs::write(root.join("top.txt"), "1").unwrap();
        fs::write(root.join("a/b/c/deep.txt"), "2").unwrap();
        fs::write(root.join("a/.snapshot/hourly/old.txt"), "3").unwrap();

        temp
    }

    fn discovered_paths(discoveries: &[Discovery]) -> Vec<PathBuf> {
        let mut paths: Vec<_> = discoveries.iter().map(|d| d.path().to_path_buf()).collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_enumerates_every_directory_once() {
        let temp = create_test_tree();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty());
        let collected = Mutex::new(Vec::new());

        let stats = DirectoryEnumerator::new(&ctx, 4)
            .enumerate(|d| collected.lock().push(d))
            .unwrap();

        let paths = discovered_paths(&collected.into_inner());
        assert_eq!(
            paths,
            vec![
                PathBuf::from(""),
                PathBuf::from("a"),
                PathBuf::from("a/.snapshot"),
                PathBuf::from("a/.snapshot/hourly"),
                PathBuf::from("a/b"),
                PathBuf::from("a/b/c"),
                PathBuf::from("d"),
            ]
        );
        assert_eq!(stats.dirs, 7);
        assert_eq!(stats.unreadable, 0);
    }

    #[test]
    fn test_excluded_subtree_is_pruned() {
        let temp = create_test_tree();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::new([".snapshot"]).unwrap());
        let collected = Mutex::new(Vec::new());

        DirectoryEnumerator::new(&ctx, 2)
            .enumerate(|d| collected.lock().push(d))
            .unwrap();

        let paths = discovered_paths(&collected.into_inner());
        assert!(paths.iter().all(|p| !p.starts_with("a/.snapshot")));
        assert_eq!(paths.len(), 5);
    }

    #[test]
    fn test_single_worker_and_empty_tree() {
        let temp = TempDir::new().unwrap();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty());
        let collected = Mutex::new(Vec::new());

        let stats = DirectoryEnumerator::new(&ctx, 0)
            .enumerate(|d| collected.lock().push(d))
            .unwrap();

        let discoveries = collected.into_inner();
        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].path(), Path::new(""));
        assert_eq!(stats.dirs, 1);
    }

    #[test]
    fn test_files_carried_when_collecting() {
        let temp = create_test_tree();
        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty());
        let collected = Mutex::new(Vec::new());

        DirectoryEnumerator::new(&ctx, 3)
            .collect_files(false)
            .enumerate(|d| collected.lock().push(d))
            .unwrap();

        for discovery in collected.into_inner() {
            if let Discovery::Listed(listing) = discovery {
                assert!(listing.files.is_empty());
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_to_ancestor_terminates() {
        let temp = create_test_tree();
        std::os::unix::fs::symlink(temp.path().join("a"), temp.path().join("a/b/back")).unwrap();

        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty()).with_follow_symlinks(true);
        let collected = Mutex::new(Vec::new());

        let stats = DirectoryEnumerator::new(&ctx, 2)
            .enumerate(|d| collected.lock().push(d))
            .unwrap();

        assert_eq!(stats.unreadable, 0);
        assert_eq!(stats.dirs, 7);
        let discoveries = collected.into_inner();
        let b = discoveries
            .iter()
            .find_map(|d| match d {
                Discovery::Listed(listing) if listing.path == Path::new("a/b") => Some(listing),
                _ => None,
            })
            .unwrap();
        assert!(b.file_paths().contains(&PathBuf::from("a/b/back")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_alias_keeps_real_directory() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("a")).unwrap();
        fs::write(temp.path().join("a/f"), "x").unwrap();
        // Sorts before "a", so a single worker meets the link first.
        std::os::unix::fs::symlink(temp.path().join("a"), temp.path().join("0link")).unwrap();

        let ctx = WalkContext::new(temp.path(), ExclusionFilter::empty()).with_follow_symlinks(true);
        let collected = Mutex::new(Vec::new());

        DirectoryEnumerator::new(&ctx, 1)
            .enumerate(|d| collected.lock().push(d))
            .unwrap();

        let paths = discovered_paths(&collected.into_inner());
        assert_eq!(paths, vec![PathBuf::from(""), PathBuf::from("a")]);
    }
}
