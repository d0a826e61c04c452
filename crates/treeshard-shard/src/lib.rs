//! Shard assignment and output for treeshard.
//!
//! [`Sharder`] drives a whole run: it walks the tree with
//! [`treeshard_scan`], hands every unit to a [`ShardAssigner`] and writes
//! the buckets through a [`ShardWriter`].
//!
//! ```rust,no_run
//! use treeshard_core::RunConfig;
//! use treeshard_shard::Sharder;
//!
//! let config = RunConfig::new("/data/project", "/scratch/shards", 64);
//! let report = Sharder::new(config)?.run()?;
//! println!("spread {} over {} shards", report.balance.spread, report.shards);
//! # Ok::<(), treeshard_core::ShardError>(())
//! ```

mod assign;
mod sharder;
mod writer;

pub use assign::{Balance, ShardAssigner, ShardBucket};
pub use sharder::{RunReport, Sharder, Timings, SUMMARY_FILE};
pub use writer::{ShardOutput, ShardWriter, StagedShards};
