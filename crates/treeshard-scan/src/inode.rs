//! Inode tracking for symlink loop detection.

use std::path::{Path, PathBuf};

use dashmap::DashMap;

/// Identity of a directory on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeInfo {
    /// Inode number.
    pub inode: u64,
    /// Device ID.
    pub device: u64,
}

impl InodeInfo {
    /// Create new inode info.
    pub fn new(inode: u64, device: u64) -> Self {
        Self { inode, device }
    }

    /// Read the identity from metadata. `None` where the platform has no
    /// inode numbers.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self::new(metadata.ino(), metadata.dev()))
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Records which followed symlink owns each directory outside the root, so
/// a target reached through several links, or through a link cycle, is
/// descended exactly once.
///
/// Uses a concurrent map keyed on (inode, device) pairs. The decision for a
/// given link is stable: asking again for the same link gives the same
/// answer, which both walk phases rely on.
#[derive(Debug, Default)]
pub struct InodeTracker {
    owners: DashMap<InodeInfo, PathBuf>,
}

impl InodeTracker {
    /// Create a new inode tracker.
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
        }
    }

    /// Claim `info` for the link at `link`. Returns `true` if `link` is the
    /// first claimant (or already owns it).
    pub fn claim(&self, info: InodeInfo, link: &Path) -> bool {
        let owner = self
            .owners
            .entry(info)
            .or_insert_with(|| link.to_path_buf());
        owner.as_path() == link
    }

    /// Get the number of directories claimed.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Check if nothing has been claimed.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_link_owns_inode() {
        let tracker = InodeTracker::new();
        let info = InodeInfo::new(12345, 1);

        assert!(tracker.claim(info, Path::new("b/link")));
        assert!(!tracker.claim(info, Path::new("a/link")));
        // Asking again for the owner gives the same answer.
        assert!(tracker.claim(info, Path::new("b/link")));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_different_devices() {
        let tracker = InodeTracker::new();

        assert!(tracker.claim(InodeInfo::new(12345, 1), Path::new("x")));
        assert!(tracker.claim(InodeInfo::new(12345, 2), Path::new("y")));
        assert_eq!(tracker.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_metadata() {
        let temp = tempfile::TempDir::new().unwrap();
        let a = std::fs::metadata(temp.path()).unwrap();
        let b = std::fs::metadata(temp.path()).unwrap();
        assert_eq!(InodeInfo::from_metadata(&a), InodeInfo::from_metadata(&b));
    }
}
