/// Failure signature sets
pub mod signatures;

/// Line classification into failure occurrences
pub mod failure_classifier;

pub use failure_classifier::FailureClassifier;
pub use signatures::SignatureSet;
