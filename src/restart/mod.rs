/// Per-service restart state machine
pub mod controller;

/// Tiered remote restart commands
pub mod executor;

pub use controller::{RestartController, RestartPhase, TriggerOutcome};
pub use executor::{ExecutorSettings, RestartExecutor, ServiceRestarter};
