//! Units of work handed to the shard assigner.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WalkWarning;

/// What a unit stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    /// A directory together with its immediate file entries.
    Bundle {
        /// Root-relative paths of the directory's files.
        files: Vec<PathBuf>,
    },
    /// A directory entry on its own.
    Directory,
    /// A single file.
    File,
    /// A directory whose listing failed. Writes no paths.
    Unreadable,
}

/// A path plus its cost estimate. Produced by the walker, consumed once by
/// the assigner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathUnit {
    /// Path relative to the walk root (empty for the root itself).
    pub path: PathBuf,
    /// Unit kind.
    pub kind: UnitKind,
    /// Cost estimate used for balancing.
    pub weight: u64,
    /// Non-fatal problems met while producing this unit.
    pub warnings: Vec<WalkWarning>,
}

impl PathUnit {
    /// A whole directory with its files.
    pub fn bundle(path: impl Into<PathBuf>, files: Vec<PathBuf>, weight: u64) -> Self {
        Self {
            path: path.into(),
            kind: UnitKind::Bundle { files },
            weight,
            warnings: Vec::new(),
        }
    }

    /// A bare directory entry (weight 0).
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: UnitKind::Directory,
            weight: 0,
            warnings: Vec::new(),
        }
    }

    /// A single file.
    pub fn file(path: impl Into<PathBuf>, weight: u64) -> Self {
        Self {
            path: path.into(),
            kind: UnitKind::File,
            weight,
            warnings: Vec::new(),
        }
    }

    /// A directory that could not be read.
    pub fn unreadable(path: impl Into<PathBuf>, warning: WalkWarning) -> Self {
        Self {
            path: path.into(),
            kind: UnitKind::Unreadable,
            weight: 0,
            warnings: vec![warning],
        }
    }

    /// Attach warnings.
    pub fn with_warnings(mut self, warnings: Vec<WalkWarning>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Whether this unit is the walk root.
    pub fn is_root(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// Root-relative paths this unit contributes to a shard file.
    ///
    /// The root directory itself is never listed; its files are.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        let own = match self.kind {
            UnitKind::Unreadable => None,
            UnitKind::File => Some(self.path.as_path()),
            UnitKind::Bundle { .. } | UnitKind::Directory if self.is_root() => None,
            UnitKind::Bundle { .. } | UnitKind::Directory => Some(self.path.as_path()),
        };
        let files: &[PathBuf] = match &self.kind {
            UnitKind::Bundle { files } => files,
            _ => &[],
        };
        own.into_iter().chain(files.iter().map(PathBuf::as_path))
    }

    /// Number of paths this unit contributes.
    pub fn path_count(&self) -> usize {
        self.paths().count()
    }

    /// Number of warnings that count as errors.
    pub fn error_count(&self) -> usize {
        self.warnings.iter().filter(|w| w.is_error()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WarningKind;

    #[test]
    fn test_bundle_paths_include_directory_and_files() {
        let unit = PathUnit::bundle(
            "a",
            vec![PathBuf::from("a/1.txt"), PathBuf::from("a/2.txt")],
            2,
        );
        let paths: Vec<_> = unit.paths().collect();
        assert_eq!(
            paths,
            vec![Path::new("a"), Path::new("a/1.txt"), Path::new("a/2.txt")]
        );
        assert_eq!(unit.path_count(), 3);
    }

    #[test]
    fn test_root_bundle_lists_only_files() {
        let unit = PathUnit::bundle("", vec![PathBuf::from("top.txt")], 1);
        assert!(unit.is_root());
        assert_eq!(unit.paths().collect::<Vec<_>>(), vec![Path::new("top.txt")]);
    }

    #[test]
    fn test_unreadable_writes_nothing() {
        let warning = WalkWarning::new("locked", "denied", WarningKind::PermissionDenied);
        let unit = PathUnit::unreadable("locked", warning);
        assert_eq!(unit.path_count(), 0);
        assert_eq!(unit.weight, 0);
        assert_eq!(unit.error_count(), 1);
    }
}
