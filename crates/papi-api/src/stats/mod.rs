//! Usage statistics: the live cluster snapshot and the historical
//! per-namespace accounting summaries

pub mod accounting;
pub mod cluster;
pub mod handlers;

pub use cluster::{ClusterStats, StatsHolder};
