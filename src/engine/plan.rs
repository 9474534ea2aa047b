//! Audio plan state
//!
//! The mixing engine is the source of truth for the active plan. The
//! coordinator keeps a cached copy, persisted to disk so a restart resumes the
//! last known plan, and reconciles it toward the engine periodically.

use crate::engine::client::EngineClient;
use crate::error::PlanError;
use crate::publish::EventPublisher;
use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Plans the installation knows how to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanId {
    A1,
    A2,
    B1,
    B2,
    B3,
    C,
    D,
}

impl PlanId {
    pub const ALL: [PlanId; 7] = [
        PlanId::A1,
        PlanId::A2,
        PlanId::B1,
        PlanId::B2,
        PlanId::B3,
        PlanId::C,
        PlanId::D,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlanId::A1 => "A1",
            PlanId::A2 => "A2",
            PlanId::B1 => "B1",
            PlanId::B2 => "B2",
            PlanId::B3 => "B3",
            PlanId::C => "C",
            PlanId::D => "D",
        }
    }

    /// Exact, case-sensitive match against the known identifiers
    pub fn parse(value: &str) -> Result<Self, PlanError> {
        Self::ALL
            .iter()
            .copied()
            .find(|plan| plan.as_str() == value)
            .ok_or_else(|| PlanError::Invalid(value.to_string()))
    }
}

impl FromStr for PlanId {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk form of the active plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPlan {
    pub plan: String,
    /// Epoch seconds of the last save
    pub timestamp: i64,
}

/// JSON file holding the last active plan
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved plan, falling back to `default` when the file is
    /// missing or unreadable
    pub fn load(&self, default: &str) -> String {
        if !self.path.exists() {
            info!(
                "No saved plan state found, using default: {}",
                default
            );
            return default.to_string();
        }

        let loaded = std::fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                serde_json::from_str::<PersistedPlan>(&contents).map_err(|e| e.to_string())
            });
        match loaded {
            Ok(saved) => {
                info!("Loaded plan state: {}", saved.plan);
                saved.plan
            }
            Err(e) => {
                error!(
                    "Failed to load plan state from {}: {}",
                    self.path.display(),
                    e
                );
                default.to_string()
            }
        }
    }

    pub fn save(&self, plan: &str) -> Result<(), PlanError> {
        let state = PersistedPlan {
            plan: plan.to_string(),
            timestamp: Utc::now().timestamp(),
        };
        let contents =
            serde_json::to_string(&state).map_err(|e| PlanError::Persist(e.to_string()))?;
        std::fs::write(&self.path, contents).map_err(|e| {
            PlanError::Persist(format!("{}: {}", self.path.display(), e))
        })?;
        info!("Saved plan state: {}", plan);
        Ok(())
    }
}

/// Applies plan changes to the engine and keeps the cached copy in step
pub struct PlanManager {
    engine: Arc<dyn EngineClient>,
    store: PlanStore,
    publisher: Arc<EventPublisher>,
    current: Mutex<String>,
}

impl PlanManager {
    /// Create a manager whose cache starts from the persisted plan
    pub fn new(
        engine: Arc<dyn EngineClient>,
        store: PlanStore,
        publisher: Arc<EventPublisher>,
        default_plan: &str,
    ) -> Self {
        let current = store.load(default_plan);
        Self {
            engine,
            store,
            publisher,
            current: Mutex::new(current),
        }
    }

    pub fn current(&self) -> String {
        self.current.lock().clone()
    }

    fn adopt(&self, plan: &str) {
        let previous = std::mem::replace(&mut *self.current.lock(), plan.to_string());
        info!("Changed plan from {} to {}", previous, plan);
        if let Err(e) = self.store.save(plan) {
            error!("{}", e);
        }
    }

    /// Validate `plan`, push it to the engine, then persist and publish it
    ///
    /// # Errors
    ///
    /// * `PlanError::Invalid` - not a known plan; nothing is sent
    /// * `PlanError::Engine` - the engine failed or answered empty; the cache
    ///   is left untouched
    pub async fn apply(&self, plan: &str) -> Result<PlanId, PlanError> {
        let id = PlanId::parse(plan)?;
        info!("Changing plan from {} to {}", self.current(), id);

        let response = self.engine.set_plan(id.as_str()).await?;
        info!("Engine response: {}", response);

        self.adopt(id.as_str());
        self.publish_status().await;
        Ok(id)
    }

    /// Push the cached plan to the engine again
    pub async fn resync(&self) -> Result<PlanId, PlanError> {
        let plan = self.current();
        self.apply(&plan).await
    }

    /// Pull the engine's plan into the cache
    ///
    /// A non-empty engine plan that differs from the cache is adopted as is,
    /// without a `set_plan` round-trip.
    ///
    /// # Returns
    ///
    /// The adopted plan, or `None` when nothing changed
    pub async fn reconcile(&self) -> Result<Option<String>, PlanError> {
        let engine_plan = self.engine.get_plan().await?;
        let engine_plan = engine_plan.trim();
        let current = self.current();

        if engine_plan.is_empty() || engine_plan == current {
            return Ok(None);
        }

        warn!(
            "Plan drift detected. Engine: {}, cached: {}",
            engine_plan, current
        );
        self.adopt(engine_plan);
        self.publish_status().await;
        Ok(Some(engine_plan.to_string()))
    }

    /// Publish the cached plan; failures are logged
    pub async fn publish_status(&self) {
        let plan = self.current();
        if let Err(e) = self.publisher.publish_plan_status(&plan).await {
            error!("Failed to publish plan status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusTopics;
    use crate::engine::client::MockEngine;
    use crate::error::EngineError;
    use crate::publish::{MemoryBus, MessageBus};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        path: PathBuf,
        engine: Arc<MockEngine>,
        bus: Arc<MemoryBus>,
        manager: PlanManager,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("current_plan.json");
        let engine = Arc::new(MockEngine::new());
        let bus = Arc::new(MemoryBus::new());
        let publisher = Arc::new(EventPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            BusTopics::default(),
            "server-agent",
        ));
        let manager = PlanManager::new(
            Arc::clone(&engine) as Arc<dyn EngineClient>,
            PlanStore::new(&path),
            publisher,
            "A1",
        );
        Harness {
            _dir: dir,
            path,
            engine,
            bus,
            manager,
        }
    }

    fn saved(path: &Path) -> PersistedPlan {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_plan_id_parse() {
        for plan in PlanId::ALL {
            assert_eq!(PlanId::parse(plan.as_str()).unwrap(), plan);
        }
        assert_eq!("B3".parse::<PlanId>().unwrap(), PlanId::B3);
        assert!(matches!(PlanId::parse("b2"), Err(PlanError::Invalid(_))));
        assert!(PlanId::parse("E").is_err());
        assert!(PlanId::parse("").is_err());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_engine_plan_without_set_plan() {
        let h = harness();
        assert_eq!(h.manager.current(), "A1");
        h.engine.respond("get_plan", "B2");

        let adopted = h.manager.reconcile().await.unwrap();

        assert_eq!(adopted.as_deref(), Some("B2"));
        assert_eq!(h.manager.current(), "B2");
        assert_eq!(h.engine.commands(), vec!["get_plan"]);
        assert_eq!(saved(&h.path).plan, "B2");
        assert_eq!(h.bus.last_json("system/status").unwrap()["plan"], "B2");
        assert_eq!(h.bus.last_json("system/plan").unwrap()["plan"], "B2");

        // converged: a second pass changes nothing
        assert_eq!(h.manager.reconcile().await.unwrap(), None);
        assert_eq!(h.bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_unknown_engine_value() {
        let h = harness();
        h.engine.respond("get_plan", "X9");

        assert_eq!(h.manager.reconcile().await.unwrap().as_deref(), Some("X9"));
        assert_eq!(h.manager.current(), "X9");
    }

    #[tokio::test]
    async fn test_reconcile_ignores_empty_engine_plan() {
        let h = harness();
        h.engine.respond_empty_once("get_plan");

        assert!(matches!(
            h.manager.reconcile().await,
            Err(PlanError::Engine(EngineError::EmptyResponse(_)))
        ));
        assert_eq!(h.manager.current(), "A1");
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_apply_valid_plan() {
        let h = harness();

        assert_eq!(h.manager.apply("C").await.unwrap(), PlanId::C);
        assert_eq!(h.engine.commands(), vec!["set_plan C"]);
        assert_eq!(h.manager.current(), "C");
        assert_eq!(saved(&h.path).plan, "C");
        assert!(saved(&h.path).timestamp > 0);
        assert_eq!(h.bus.published_on("system/status").len(), 1);
    }

    #[tokio::test]
    async fn test_apply_invalid_plan_has_no_side_effects() {
        let h = harness();

        assert!(matches!(
            h.manager.apply("Z").await,
            Err(PlanError::Invalid(_))
        ));
        assert!(h.engine.commands().is_empty());
        assert!(!h.path.exists());
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_apply_engine_failure_keeps_cache() {
        let h = harness();
        h.engine.set_unreachable(true);

        assert!(matches!(
            h.manager.apply("B1").await,
            Err(PlanError::Engine(_))
        ));
        assert_eq!(h.manager.current(), "A1");
        assert!(!h.path.exists());
    }

    #[tokio::test]
    async fn test_resync_pushes_cached_plan() {
        let h = harness();
        h.manager.apply("D").await.unwrap();
        h.engine.clear();

        h.manager.resync().await.unwrap();
        assert_eq!(h.engine.commands(), vec!["set_plan D"]);
    }

    #[test]
    fn test_store_round_trip_and_fallbacks() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path().join("plan.json"));

        assert_eq!(store.load("A1"), "A1");
        store.save("B3").unwrap();
        assert_eq!(store.load("A1"), "B3");

        std::fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load("A1"), "A1");
    }

    #[test]
    fn test_store_save_failure() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path().join("missing").join("plan.json"));
        assert!(matches!(store.save("A1"), Err(PlanError::Persist(_))));
    }

    #[test]
    fn test_manager_resumes_persisted_plan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        PlanStore::new(&path).save("A2").unwrap();

        let publisher = Arc::new(EventPublisher::new(
            Arc::new(MemoryBus::new()) as Arc<dyn MessageBus>,
            BusTopics::default(),
            "server-agent",
        ));
        let manager = PlanManager::new(
            Arc::new(MockEngine::new()),
            PlanStore::new(&path),
            publisher,
            "A1",
        );
        assert_eq!(manager.current(), "A2");
    }
}
