/// Configuration structures and TOML loading
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{
    BusConfig, BusTopics, Config, ConnectionConfig, EngineConfig, FleetConfig, FleetNode,
    LocalServicesConfig, PlanConfig, RestartPolicy, SignatureConfig, SupervisorConfig,
};
