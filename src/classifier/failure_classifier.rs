use crate::aggregator::{OccurrenceSnapshot, StatsAggregator};
use crate::classifier::SignatureSet;
use crate::config::SignatureConfig;
use crate::error::ConfigError;
use crate::events::{FailureCategory, StreamKey, Timestamp};
use log::debug;
use std::sync::Arc;

/// Matches log lines against the signature set of their stream's category
///
/// Classification is stateless; a match is recorded in the shared
/// `StatsAggregator` and the resulting snapshot is returned to the caller.
pub struct FailureClassifier {
    underrun: SignatureSet,
    overrun: SignatureSet,
    stats: Arc<StatsAggregator>,
}

impl FailureClassifier {
    pub fn new(underrun: SignatureSet, overrun: SignatureSet, stats: Arc<StatsAggregator>) -> Self {
        Self {
            underrun,
            overrun,
            stats,
        }
    }

    /// Build a classifier from configured signatures
    pub fn from_config(
        config: &SignatureConfig,
        stats: Arc<StatsAggregator>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            SignatureSet::compile(&config.underrun)?,
            SignatureSet::compile(&config.overrun)?,
            stats,
        ))
    }

    fn signatures(&self, category: FailureCategory) -> &SignatureSet {
        match category {
            FailureCategory::Underrun => &self.underrun,
            FailureCategory::BufferOverrun => &self.overrun,
        }
    }

    /// Return the matching pattern, without recording anything
    pub fn matching_signature(&self, category: FailureCategory, line: &str) -> Option<&str> {
        self.signatures(category).first_match(line)
    }

    /// Classify one line of a stream
    ///
    /// Returns `None` for lines that match no signature of the stream's
    /// category; those leave the statistics untouched.
    pub fn classify(
        &self,
        key: &StreamKey,
        line: &str,
        now: Timestamp,
    ) -> Option<OccurrenceSnapshot> {
        let pattern = self.matching_signature(key.category, line)?;
        debug!("{} matched '{}': {}", key, pattern, line);
        Some(self.stats.record_occurrence(key, line, now))
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }
}
