/// Per-stream failure statistics
pub mod failure_stats;

pub use failure_stats::{
    CategorySummary, FailureStats, OccurrenceSnapshot, ServiceSummary, StatsAggregator,
};
