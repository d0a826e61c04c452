//! Single-directory listing shared by both walk phases.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use treeshard_core::{ExclusionFilter, WalkWarning, WarningKind, WeightStrategy};

use crate::inode::{InodeInfo, InodeTracker};
use crate::progress::ProgressTracker;

/// A regular file or symlink found in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Root-relative path.
    pub path: PathBuf,
    /// Apparent size, only read under [`WeightStrategy::Bytes`].
    pub size: u64,
}

impl FileEntry {
    /// Weight of this file as a stand-alone unit.
    pub fn weight(&self, strategy: WeightStrategy) -> u64 {
        match strategy {
            WeightStrategy::Bytes => self.size,
            WeightStrategy::Files | WeightStrategy::Uniform => 1,
        }
    }
}

/// Immediate contents of one accepted directory.
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    /// Root-relative path of the directory (empty for root).
    pub path: PathBuf,
    /// Accepted files, sorted by path.
    pub files: Vec<FileEntry>,
    /// Accepted subdirectories, sorted by path.
    pub subdirs: Vec<PathBuf>,
    /// Entry-level problems.
    pub warnings: Vec<WalkWarning>,
}

impl DirListing {
    /// Weight of this directory as one bundle.
    pub fn weight(&self, strategy: WeightStrategy) -> u64 {
        match strategy {
            WeightStrategy::Files => self.files.len() as u64,
            WeightStrategy::Bytes => self.files.iter().map(|f| f.size).sum(),
            WeightStrategy::Uniform => 1,
        }
    }

    /// Root-relative file paths.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Outcome of listing one directory.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// The directory was read.
    Listed(DirListing),
    /// The directory could not be read; it has no children and weight 0.
    Unreadable { path: PathBuf, warning: WalkWarning },
}

impl Discovery {
    /// Root-relative path of the directory.
    pub fn path(&self) -> &Path {
        match self {
            Discovery::Listed(listing) => &listing.path,
            Discovery::Unreadable { path, .. } => path,
        }
    }
}

/// What to do with a symlink when links are followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkAction {
    /// Walk the target as a subdirectory.
    Descend,
    /// List the link itself like a file.
    Entry,
    /// List the link like a file and report that its target is covered
    /// elsewhere.
    Alias,
}

/// State shared by every walker thread for one run. Read-only apart from
/// the concurrent link ownership map and the progress counters.
#[derive(Debug)]
pub struct WalkContext {
    root: PathBuf,
    canonical_root: PathBuf,
    filter: ExclusionFilter,
    weight: WeightStrategy,
    follow_symlinks: bool,
    link_owners: InodeTracker,
    progress: Arc<ProgressTracker>,
}

impl WalkContext {
    /// Create a context for walking `root`, which should be absolute.
    pub fn new(root: impl Into<PathBuf>, filter: ExclusionFilter) -> Self {
        let root = root.into();
        let canonical_root = fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
            filter,
            weight: WeightStrategy::default(),
            follow_symlinks: false,
            link_owners: InodeTracker::new(),
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    pub fn with_weight(mut self, weight: WeightStrategy) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &ExclusionFilter {
        &self.filter
    }

    pub fn weight(&self) -> WeightStrategy {
        self.weight
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Absolute path of a root-relative path.
    pub fn absolute(&self, rel: &Path) -> PathBuf {
        if rel.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// List one directory.
    ///
    /// With `collect_files` unset only subdirectories are gathered, which is
    /// all Phase 1 needs in `byfile` mode. Excluded children are dropped
    /// here, so an excluded subdirectory is never queued. Listing the same
    /// directory twice gives the same split between files and subdirectories,
    /// followed links included.
    pub fn list(&self, rel: &Path, collect_files: bool) -> Discovery {
        let abs = self.absolute(rel);
        let entries = match fs::read_dir(&abs) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %abs.display(), error = %err, "cannot read directory");
                return Discovery::Unreadable {
                    path: rel.to_path_buf(),
                    warning: WalkWarning::read_error(&abs, &err),
                };
            }
        };

        let want_size = collect_files && self.weight == WeightStrategy::Bytes;
        let mut listing = DirListing {
            path: rel.to_path_buf(),
            ..Default::default()
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    listing.warnings.push(WalkWarning::read_error(&abs, &err));
                    continue;
                }
            };

            let name = entry.file_name();
            if self.filter.excluded_name(&name) {
                continue;
            }
            let child = rel.join(&name);

            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    listing
                        .warnings
                        .push(WalkWarning::metadata_error(entry.path(), &err));
                    continue;
                }
            };

            if file_type.is_dir() {
                listing.subdirs.push(child);
                continue;
            }

            if file_type.is_symlink() && self.follow_symlinks {
                match self.follow_link(&child, &entry.path()) {
                    LinkAction::Descend => {
                        listing.subdirs.push(child);
                        continue;
                    }
                    LinkAction::Entry => {}
                    LinkAction::Alias => {
                        listing
                            .warnings
                            .push(WalkWarning::symlink_loop(entry.path()));
                    }
                }
            }

            if file_type.is_file() || file_type.is_symlink() {
                if !collect_files {
                    continue;
                }
                let size = if want_size {
                    match entry.metadata() {
                        Ok(metadata) => metadata.len(),
                        Err(err) => {
                            listing
                                .warnings
                                .push(WalkWarning::metadata_error(entry.path(), &err));
                            0
                        }
                    }
                } else {
                    0
                };
                listing.files.push(FileEntry { path: child, size });
            } else if collect_files {
                listing.warnings.push(WalkWarning::new(
                    entry.path(),
                    "Special file skipped",
                    WarningKind::SpecialFile,
                ));
            }
        }

        listing.files.sort_by(|a, b| a.path.cmp(&b.path));
        listing.subdirs.sort();
        Discovery::Listed(listing)
    }

    /// Decide how a symlink met during the walk is treated.
    ///
    /// A link is only descended when it leads to a directory outside the
    /// root that no other link has claimed. Targets inside the root are
    /// walked under their real path, and a target that contains the root
    /// would walk the root again, so both are kept as plain entries. Real
    /// directories are never subject to this check.
    fn follow_link(&self, rel: &Path, abs: &Path) -> LinkAction {
        let Ok(target) = fs::canonicalize(abs) else {
            return LinkAction::Entry;
        };
        let metadata = match fs::metadata(&target) {
            Ok(metadata) if metadata.is_dir() => metadata,
            _ => return LinkAction::Entry,
        };
        if target.starts_with(&self.canonical_root) || self.canonical_root.starts_with(&target) {
            debug!(link = %abs.display(), target = %target.display(), "link stays inside the tree, not followed");
            return LinkAction::Entry;
        }
        match InodeInfo::from_metadata(&metadata) {
            Some(info) if self.link_owners.claim(info, rel) => LinkAction::Descend,
            Some(_) => {
                debug!(link = %abs.display(), target = %target.display(), "target already followed through another link");
                LinkAction::Alias
            }
            // Without inode numbers a cycle cannot be told apart.
            None => LinkAction::Entry,
        }
    }
}
