//! Failure signatures
//!
//! A signature set is an ordered list of case-insensitive regular expressions.
//! Patterns may overlap; the first matching pattern wins, so a line counts at
//! most once per set.

use crate::error::ConfigError;
use regex::{Regex, RegexBuilder};

/// Ordered, case-insensitive set of failure patterns
#[derive(Debug, Clone)]
pub struct SignatureSet {
    patterns: Vec<Regex>,
}

impl SignatureSet {
    /// Compile a set of patterns
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first pattern that
    /// does not compile.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        ConfigError::ValidationError(format!(
                            "invalid signature '{}': {}",
                            p.as_ref(),
                            e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Return the first pattern matching the line
    pub fn first_match(&self, line: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.is_match(line))
            .map(|p| p.as_str())
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.first_match(line).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
