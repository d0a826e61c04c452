//! Two-phase parallel directory walker for treeshard.
//!
//! # Overview
//!
//! - **Phase 1** ([`DirectoryEnumerator`]) discovers every accepted
//!   directory through an explicit work queue drained by a fixed pool of
//!   threads, pruning excluded subtrees without descending into them.
//! - **Phase 2** ([`FileLister`]) expands directories into their immediate
//!   files on a second, independently sized pool. It is only needed when
//!   files are balanced one by one.
//!
//! Both phases report through a [`WalkContext`], which carries the root,
//! the exclusion filter, the weight strategy and the shared progress
//! counters. Read errors never abort a walk: the directory is reported as
//! [`Discovery::Unreadable`] and the walk goes on.
//!
//! # Example
//!
//! ```rust,no_run
//! use treeshard_scan::{DirectoryEnumerator, Discovery, WalkContext};
//! use treeshard_core::ExclusionFilter;
//!
//! let filter = ExclusionFilter::new([".snapshot"]).unwrap();
//! let ctx = WalkContext::new("/data/project", filter);
//! let stats = DirectoryEnumerator::new(&ctx, 16)
//!     .enumerate(|discovery| {
//!         if let Discovery::Listed(listing) = discovery {
//!             println!("{} ({} files)", listing.path.display(), listing.files.len());
//!         }
//!     })
//!     .unwrap();
//!
//! println!("{} directories", stats.dirs);
//! ```

mod enumerator;
mod inode;
mod lister;
mod listing;
mod progress;

pub use enumerator::{DirectoryEnumerator, EnumerateStats};
pub use inode::{InodeInfo, InodeTracker};
pub use lister::{FileLister, ListStats};
pub use listing::{DirListing, Discovery, FileEntry, WalkContext};
pub use progress::{ProgressTracker, WalkProgress};

// Re-export core types for convenience
pub use treeshard_core::{ExclusionFilter, ShardError, WalkWarning, WarningKind, WeightStrategy};
