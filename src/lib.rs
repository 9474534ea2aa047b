use std::future::Future;
use std::pin::Pin;

/// Error types for every concern of the coordinator
pub mod error;

/// Stream identities and published event payloads
pub mod events;

/// Configuration management
pub mod config;

/// Remote shell sessions to fleet nodes
pub mod remote;

/// Remote service log followers
pub mod collectors;

/// Failure signature matching
pub mod classifier;

/// Per-stream failure statistics and summaries
pub mod aggregator;

/// Rate-limited remote restarts
pub mod restart;

/// Stream liveness supervision
pub mod supervisor;

/// Message bus publishing and inbound commands
pub mod publish;

/// Mixing engine client and plan state
pub mod engine;

/// Coordinator-host service restarts
pub mod local_services;

/// Component wiring and control loops
pub mod coordinator;

/// Boxed future returned by the async trait methods of this crate
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{
    BusError, CommandError, ConfigError, EngineError, PlanError, RestartError, SessionError,
    StreamError,
};
