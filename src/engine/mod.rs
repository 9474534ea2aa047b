/// Mixing engine control socket client
pub mod client;

/// Active plan cache, persistence and reconciliation
pub mod plan;

pub use client::{EngineClient, MockEngine, TcpEngineClient};
pub use plan::{PersistedPlan, PlanId, PlanManager, PlanStore};
