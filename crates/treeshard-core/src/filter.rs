//! Exclusion rules.
//!
//! A path is excluded when any rule matches any of its components exactly.
//! Literal rules compare the whole component (`snap` does not match
//! `.snapshot`); glob rules must match the whole component and `*` never
//! crosses a separator. Paths are tested relative to the walk root, so the
//! root's own ancestors never cause an exclusion.
//!
//! Because matching is per component, excluding a directory excludes every
//! path beneath it, which lets the walker prune the subtree without
//! descending into it.

use std::ffi::OsStr;
use std::path::{Component, Path};

use globset::{GlobBuilder, GlobMatcher};

use crate::error::ShardError;

/// A single exclusion pattern.
#[derive(Debug, Clone)]
pub enum ExclusionRule {
    /// Exact component name.
    Literal(String),
    /// Glob matched against one component.
    Glob {
        pattern: String,
        matcher: GlobMatcher,
    },
}

impl ExclusionRule {
    /// Parse a pattern. Anything containing `*`, `?`, `[` or `{` is a glob.
    pub fn parse(pattern: &str) -> Result<Self, ShardError> {
        if pattern.is_empty() {
            return Err(ShardError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "pattern is empty".to_string(),
            });
        }
        if pattern.contains(std::path::is_separator) {
            return Err(ShardError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "patterns match a single path component and cannot contain a separator"
                    .to_string(),
            });
        }

        if !pattern.contains(['*', '?', '[', '{']) {
            return Ok(Self::Literal(pattern.to_string()));
        }

        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| ShardError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self::Glob {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// The pattern as configured.
    pub fn pattern(&self) -> &str {
        match self {
            Self::Literal(name) => name,
            Self::Glob { pattern, .. } => pattern,
        }
    }

    /// Test one path component.
    pub fn matches(&self, component: &OsStr) -> bool {
        match self {
            Self::Literal(name) => component == OsStr::new(name),
            Self::Glob { matcher, .. } => matcher.is_match(Path::new(component)),
        }
    }
}

/// Set of exclusion rules. Immutable once built and safe to share between
/// threads.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    rules: Vec<ExclusionRule>,
}

impl ExclusionFilter {
    /// Build a filter from configured patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, ShardError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|p| ExclusionRule::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// A filter that accepts everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The configured rules.
    pub fn rules(&self) -> &[ExclusionRule] {
        &self.rules
    }

    /// Check whether a root-relative path is excluded.
    pub fn excluded(&self, path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        path.components().any(|component| match component {
            Component::Normal(name) => self.excluded_name(name),
            _ => false,
        })
    }

    /// Check a single component, for callers whose ancestors are already
    /// known to be accepted.
    pub fn excluded_name(&self, name: &OsStr) -> bool {
        self.rules.iter().any(|rule| rule.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_matches_whole_component() {
        let filter = ExclusionFilter::new([".snapshot"]).unwrap();

        assert!(filter.excluded(Path::new(".snapshot")));
        assert!(filter.excluded(Path::new("a/b/.snapshot/c/file.txt")));
        assert!(!filter.excluded(Path::new("a/.snapshots/file.txt")));
        assert!(!filter.excluded(Path::new("a/my.snapshot")));
    }

    #[test]
    fn test_substring_does_not_match() {
        let filter = ExclusionFilter::new(["snap"]).unwrap();
        assert!(!filter.excluded(Path::new("data/.snapshot")));
        assert!(filter.excluded(Path::new("data/snap")));
    }

    #[test]
    fn test_glob_matches_component() {
        let filter = ExclusionFilter::new(["*.tmp", "cache-?"]).unwrap();

        assert!(filter.excluded(Path::new("work/build.tmp")));
        assert!(filter.excluded(Path::new("cache-1/data")));
        assert!(!filter.excluded(Path::new("cache-10/data")));
        assert!(!filter.excluded(Path::new("work/build.tmp.bak")));
    }

    #[test]
    fn test_empty_filter() {
        let filter = ExclusionFilter::empty();
        assert!(!filter.excluded(Path::new("anything/at/all")));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            ExclusionRule::parse(""),
            Err(ShardError::InvalidPattern { .. })
        ));
        assert!(matches!(
            ExclusionRule::parse("a/b"),
            Err(ShardError::InvalidPattern { .. })
        ));
        assert!(matches!(
            ExclusionRule::parse("[unclosed"),
            Err(ShardError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_rule_kinds() {
        assert!(matches!(ExclusionRule::parse("node_modules").unwrap(), ExclusionRule::Literal(_)));
        let glob = ExclusionRule::parse("*.o").unwrap();
        assert!(matches!(glob, ExclusionRule::Glob { .. }));
        assert_eq!(glob.pattern(), "*.o");
    }
}
