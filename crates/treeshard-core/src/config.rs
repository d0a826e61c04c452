//! Run configuration types.

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ShardError;

/// Balancing granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ShardMode {
    /// A directory and its immediate files form one atomic unit.
    #[default]
    ByDir,
    /// Every file is assigned on its own.
    ByFile,
}

/// How the weight of a unit is estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WeightStrategy {
    /// Number of immediate file entries (1 per file in `byfile` mode).
    #[default]
    Files,
    /// Apparent size in bytes of the immediate file entries.
    Bytes,
    /// Every directory unit weighs 1, regardless of content.
    Uniform,
}

/// When units are handed to the assigner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Placement {
    /// Assign each unit as soon as a worker produces it.
    #[default]
    Streaming,
    /// Buffer all units, sort by weight (descending) then path, then assign.
    ///
    /// Output is identical across runs on an unchanged tree.
    Sorted,
}

/// How paths are written into shard files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PathStyle {
    /// Absolute paths (root joined with the relative path).
    #[default]
    Absolute,
    /// Paths relative to root.
    Relative,
}

/// Record separator in shard files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Newline,
    Nul,
}

impl Delimiter {
    /// The separator byte.
    pub fn byte(self) -> u8 {
        match self {
            Delimiter::Newline => b'\n',
            Delimiter::Nul => b'\0',
        }
    }

    /// File extension used for shard files with this separator.
    pub fn extension(self) -> &'static str {
        match self {
            Delimiter::Newline => "txt",
            Delimiter::Nul => "nul",
        }
    }
}

/// Configuration for a sharding run.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct RunConfig {
    /// Root of the source tree.
    pub root: PathBuf,

    /// Directory receiving shard files, logs and the summary.
    pub outdir: PathBuf,

    /// Number of shards (N).
    pub shards: usize,

    /// Balancing granularity.
    #[builder(default)]
    #[serde(default)]
    pub mode: ShardMode,

    /// Phase 1 (directory discovery) threads, 0 = available parallelism.
    #[builder(default = "DEFAULT_WORKERS1")]
    #[serde(default = "default_workers1")]
    pub workers1: usize,

    /// Phase 2 (file listing) threads, 0 = available parallelism.
    #[builder(default = "DEFAULT_WORKERS2")]
    #[serde(default = "default_workers2")]
    pub workers2: usize,

    /// Exclusion patterns, matched against single path components.
    #[builder(default)]
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Weight estimator.
    #[builder(default)]
    #[serde(default)]
    pub weight: WeightStrategy,

    /// Assignment order.
    #[builder(default)]
    #[serde(default)]
    pub placement: Placement,

    /// Absolute or root-relative output paths.
    #[builder(default)]
    #[serde(default)]
    pub path_style: PathStyle,

    /// Record separator.
    #[builder(default)]
    #[serde(default)]
    pub delimiter: Delimiter,

    /// Descend into symlinked directories.
    #[builder(default = "false")]
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Capacity of the Phase 1 to Phase 2 hand-off queue.
    #[builder(default = "DEFAULT_MAX_QUEUE")]
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Shard file name prefix.
    #[builder(default = "DEFAULT_PREFIX.to_string()")]
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// Optional manifest of every accepted directory, NUL-separated and
    /// relative to root. A relative path is taken under `outdir`.
    #[builder(default, setter(into, strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs_out: Option<PathBuf>,
}

const DEFAULT_WORKERS1: usize = 32;
const DEFAULT_WORKERS2: usize = 64;
const DEFAULT_MAX_QUEUE: usize = 200_000;
const DEFAULT_PREFIX: &str = "shard";

fn default_workers1() -> usize {
    DEFAULT_WORKERS1
}

fn default_workers2() -> usize {
    DEFAULT_WORKERS2
}

fn default_max_queue() -> usize {
    DEFAULT_MAX_QUEUE
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl RunConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.root {
            Some(ref root) if root.as_os_str().is_empty() => {
                return Err("Root path cannot be empty".to_string());
            }
            None => return Err("Root path is required".to_string()),
            _ => {}
        }
        match self.outdir {
            Some(ref outdir) if outdir.as_os_str().is_empty() => {
                return Err("Output directory cannot be empty".to_string());
            }
            None => return Err("Output directory is required".to_string()),
            _ => {}
        }
        if let Some(0) = self.shards {
            return Err("Shard count must be at least 1".to_string());
        }
        if let Some(0) = self.max_queue {
            return Err("Queue capacity must be at least 1".to_string());
        }
        if let Some(ref prefix) = self.file_prefix {
            if prefix.is_empty() || prefix.contains(std::path::is_separator) {
                return Err(format!("Invalid shard file prefix: {prefix:?}"));
            }
        }
        if let Some(Some(ref path)) = self.dirs_out {
            if path.file_name().is_none() {
                return Err(format!("Invalid directory manifest path: {}", path.display()));
            }
        }
        Ok(())
    }
}

impl From<RunConfig> for RunConfigBuilder {
    fn from(config: RunConfig) -> Self {
        let mut builder = RunConfigBuilder::default();
        builder
            .root(config.root)
            .outdir(config.outdir)
            .shards(config.shards)
            .mode(config.mode)
            .workers1(config.workers1)
            .workers2(config.workers2)
            .exclude(config.exclude)
            .weight(config.weight)
            .placement(config.placement)
            .path_style(config.path_style)
            .delimiter(config.delimiter)
            .follow_symlinks(config.follow_symlinks)
            .max_queue(config.max_queue)
            .file_prefix(config.file_prefix);
        if let Some(dirs_out) = config.dirs_out {
            builder.dirs_out(dirs_out);
        }
        builder
    }
}

impl RunConfig {
    /// Create a new run config builder.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Create a config with defaults for everything but the required fields.
    pub fn new(root: impl Into<PathBuf>, outdir: impl Into<PathBuf>, shards: usize) -> Self {
        Self {
            root: root.into(),
            outdir: outdir.into(),
            shards,
            mode: ShardMode::default(),
            workers1: DEFAULT_WORKERS1,
            workers2: DEFAULT_WORKERS2,
            exclude: Vec::new(),
            weight: WeightStrategy::default(),
            placement: Placement::default(),
            path_style: PathStyle::default(),
            delimiter: Delimiter::default(),
            follow_symlinks: false,
            max_queue: DEFAULT_MAX_QUEUE,
            file_prefix: default_prefix(),
            dirs_out: None,
        }
    }

    /// Load a config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ShardError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ShardError::io(path, e))?;
        Self::from_toml_str(&text).map_err(|message| ShardError::ConfigFile {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Check the invariants that do not need the filesystem.
    ///
    /// Configs coming from the builder are already validated; configs
    /// deserialized from a file or assembled by hand are not.
    pub fn validate(&self) -> Result<(), ShardError> {
        if self.shards == 0 {
            return Err(ShardError::InvalidConfig {
                message: "shard count must be at least 1".to_string(),
            });
        }
        if self.max_queue == 0 {
            return Err(ShardError::InvalidConfig {
                message: "queue capacity must be at least 1".to_string(),
            });
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains(std::path::is_separator) {
            return Err(ShardError::InvalidConfig {
                message: format!("invalid shard file prefix: {:?}", self.file_prefix),
            });
        }
        if let Some(path) = &self.dirs_out {
            if path.file_name().is_none() {
                return Err(ShardError::InvalidConfig {
                    message: format!("invalid directory manifest path: {}", path.display()),
                });
            }
        }
        Ok(())
    }

    /// Resolved Phase 1 worker count.
    pub fn phase1_workers(&self) -> usize {
        resolve_workers(self.workers1)
    }

    /// Resolved Phase 2 worker count.
    pub fn phase2_workers(&self) -> usize {
        resolve_workers(self.workers2)
    }

    /// File name of shard `index`.
    ///
    /// Zero-padded to five digits so a job array index maps to a name with
    /// simple formatting.
    pub fn shard_file_name(&self, index: usize) -> String {
        format!("{}_{index:05}.{}", self.file_prefix, self.delimiter.extension())
    }

    /// File name of the log companion of shard `index`.
    pub fn shard_log_name(&self, index: usize) -> String {
        format!("{}_{index:05}.log", self.file_prefix)
    }

    /// Where the directory manifest goes, if one was requested.
    pub fn dirs_manifest_path(&self) -> Option<PathBuf> {
        self.dirs_out.as_ref().map(|path| self.outdir.join(path))
    }
}

fn resolve_workers(requested: usize) -> usize {
    match requested {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RunConfig::builder()
            .root("/data/src")
            .outdir("/data/shards")
            .shards(8usize)
            .mode(ShardMode::ByFile)
            .workers1(4usize)
            .build()
            .unwrap();

        assert_eq!(config.root, PathBuf::from("/data/src"));
        assert_eq!(config.shards, 8);
        assert_eq!(config.mode, ShardMode::ByFile);
        assert_eq!(config.workers1, 4);
        assert_eq!(config.workers2, DEFAULT_WORKERS2);
        assert_eq!(config.file_prefix, "shard");
    }

    #[test]
    fn test_builder_rejects_zero_shards() {
        let result = RunConfig::builder()
            .root("/data/src")
            .outdir("/data/shards")
            .shards(0usize)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_requires_outdir() {
        let result = RunConfig::builder().root("/data/src").shards(2usize).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_zero_shards() {
        let config = RunConfig::new("/data/src", "/data/shards", 0);
        assert!(matches!(config.validate(), Err(ShardError::InvalidConfig { .. })));
    }

    #[test]
    fn test_shard_file_names() {
        let mut config = RunConfig::new("/src", "/out", 3);
        assert_eq!(config.shard_file_name(0), "shard_00000.txt");
        assert_eq!(config.shard_file_name(42), "shard_00042.txt");
        assert_eq!(config.shard_log_name(2), "shard_00002.log");

        config.delimiter = Delimiter::Nul;
        assert_eq!(config.shard_file_name(7), "shard_00007.nul");
    }

    #[test]
    fn test_dirs_manifest_path() {
        let mut config = RunConfig::new("/src", "/out", 2);
        assert_eq!(config.dirs_manifest_path(), None);

        config.dirs_out = Some(PathBuf::from("dirs.nul"));
        assert_eq!(config.dirs_manifest_path(), Some(PathBuf::from("/out/dirs.nul")));

        config.dirs_out = Some(PathBuf::from("/elsewhere/dirs.nul"));
        assert_eq!(
            config.dirs_manifest_path(),
            Some(PathBuf::from("/elsewhere/dirs.nul"))
        );

        config.dirs_out = Some(PathBuf::from("/"));
        assert!(matches!(config.validate(), Err(ShardError::InvalidConfig { .. })));
    }

    #[test]
    fn test_toml_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            root = "/data/src"
            outdir = "/data/shards"
            shards = 16
            mode = "byfile"
            exclude = [".snapshot"]
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, ShardMode::ByFile);
        assert_eq!(config.workers1, DEFAULT_WORKERS1);
        assert_eq!(config.max_queue, DEFAULT_MAX_QUEUE);
        assert_eq!(config.exclude, vec![".snapshot".to_string()]);
        assert_eq!(config.placement, Placement::Streaming);
    }

    #[test]
    fn test_builder_from_config_roundtrip() {
        let mut config = RunConfig::new("/src", "/out", 5);
        config.weight = WeightStrategy::Bytes;
        let rebuilt = RunConfigBuilder::from(config).shards(6usize).build().unwrap();
        assert_eq!(rebuilt.shards, 6);
        assert_eq!(rebuilt.weight, WeightStrategy::Bytes);
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(ShardMode::ByDir.to_string(), "bydir");
        assert_eq!("byfile".parse::<ShardMode>().unwrap(), ShardMode::ByFile);
        assert_eq!(WeightStrategy::Uniform.to_string(), "uniform");
    }
}
