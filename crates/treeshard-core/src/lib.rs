//! Core types and configuration for treeshard.
//!
//! This crate provides the data structures shared by the walker and the
//! shard assigner: the run configuration, exclusion rules, path units and
//! the error/warning types.

mod config;
mod error;
mod filter;
mod unit;

pub use config::{Delimiter, PathStyle, Placement, RunConfig, RunConfigBuilder, RunConfigBuilderError, ShardMode, WeightStrategy};
pub use error::{ShardError, WalkWarning, WarningKind};
pub use filter::{ExclusionFilter, ExclusionRule};
pub use unit::{PathUnit, UnitKind};
