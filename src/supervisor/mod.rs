/// Stream liveness audits and reconnection
pub mod health;

pub use health::{stream_keys, ConnectivityReport, HealthSupervisor, SupervisorSettings};
