use crate::aggregator::StatsAggregator;
use crate::config::RestartPolicy;
use crate::error::RestartError;
use crate::events::{RestartOutcome, RestartStatus, ServiceKey, Timestamp};
use crate::publish::EventPublisher;
use crate::restart::executor::ServiceRestarter;
use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Observable state of one service's restart protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Idle,
    CooldownBlocked,
    AttemptLimitReached,
    Restarting,
}

/// Result of a trigger that passed no policy rejection
#[derive(Debug)]
pub enum TriggerOutcome {
    /// Another restart of the same service is running; the trigger is dropped
    AlreadyInFlight,
    /// A restart was spawned; the handle resolves to the published outcome
    Started {
        attempt: u32,
        handle: JoinHandle<RestartOutcome>,
    },
}

#[derive(Debug, Default)]
struct RestartState {
    attempts: u32,
    last_attempt: Option<Timestamp>,
}

struct RestartSlot {
    // held by the restart task for the whole execution
    guard: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<RestartState>,
}

impl RestartSlot {
    fn new() -> Self {
        Self {
            guard: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(RestartState::default()),
        }
    }
}

/// Rate-limited restart protocol for encoder services
///
/// Every (node, service) pair owns a slot with a non-blocking guard, an
/// attempt counter and the time of the last attempt. A trigger is dropped
/// while a restart is in flight, rejected inside the cooldown and rejected
/// for good once `max_attempts` is reached, until [`RestartController::reset`].
pub struct RestartController {
    slots: Mutex<HashMap<ServiceKey, Arc<RestartSlot>>>,
    restarter: Arc<dyn ServiceRestarter>,
    stats: Arc<StatsAggregator>,
    publisher: Arc<EventPublisher>,
    policy: RestartPolicy,
}

impl RestartController {
    pub fn new(
        restarter: Arc<dyn ServiceRestarter>,
        stats: Arc<StatsAggregator>,
        publisher: Arc<EventPublisher>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            restarter,
            stats,
            publisher,
            policy,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn slot(&self, key: &ServiceKey) -> Arc<RestartSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RestartSlot::new())),
        )
    }

    fn existing(&self, key: &ServiceKey) -> Option<Arc<RestartSlot>> {
        self.slots.lock().get(key).map(Arc::clone)
    }

    /// Request a restart of `key`
    ///
    /// Must be called from within a tokio runtime; the restart runs on a
    /// detached task that holds the service's guard until it finishes.
    ///
    /// # Errors
    ///
    /// * `RestartError::CooldownBlocked` - the last attempt is too recent
    /// * `RestartError::AttemptLimitReached` - `max_attempts` restarts were already tried
    pub fn trigger(&self, key: &ServiceKey, now: Timestamp) -> Result<TriggerOutcome, RestartError> {
        let slot = self.slot(key);
        let guard = match Arc::clone(&slot.guard).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Restart already in progress for {}, skipping", key);
                return Ok(TriggerOutcome::AlreadyInFlight);
            }
        };

        let attempt = {
            let mut state = slot.state.lock();
            if let Some(last) = state.last_attempt {
                let elapsed = now - last;
                if elapsed < self.policy.cooldown() {
                    let remaining_secs = (self.policy.cooldown() - elapsed).num_seconds();
                    warn!(
                        "Restart cooldown active for {} ({}s remaining)",
                        key, remaining_secs
                    );
                    return Err(RestartError::CooldownBlocked {
                        node: key.node.clone(),
                        service: key.service.clone(),
                        remaining_secs,
                    });
                }
            }
            if state.attempts >= self.policy.max_attempts {
                error!(
                    "Max restart attempts ({}) reached for {}, manual reset required",
                    self.policy.max_attempts, key
                );
                return Err(RestartError::AttemptLimitReached {
                    node: key.node.clone(),
                    service: key.service.clone(),
                    max_attempts: self.policy.max_attempts,
                });
            }
            state.attempts += 1;
            state.last_attempt = Some(now);
            state.attempts
        };

        self.stats.record_restart_attempt(key, now);
        info!(
            "Starting restart of {} (attempt {}/{})",
            key, attempt, self.policy.max_attempts
        );

        let execution = self.restarter.restart(&key.node, &key.service, attempt);
        let stats = Arc::clone(&self.stats);
        let publisher = Arc::clone(&self.publisher);
        let key = key.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let outcome = match execution.await {
                Ok(strategy) => {
                    stats.reset_after_restart(&key);
                    RestartOutcome {
                        system: key.node.clone(),
                        service: key.service.clone(),
                        timestamp: Utc::now(),
                        status: RestartStatus::Success,
                        strategy: Some(strategy),
                        attempt,
                        message: format!("{} service restarted successfully", key.service),
                        source: publisher.source().to_string(),
                    }
                }
                Err(e) => {
                    error!("Restart of {} failed: {}", key, e);
                    RestartOutcome {
                        system: key.node.clone(),
                        service: key.service.clone(),
                        timestamp: Utc::now(),
                        status: RestartStatus::Failure,
                        strategy: None,
                        attempt,
                        message: e.to_string(),
                        source: publisher.source().to_string(),
                    }
                }
            };
            if let Err(e) = publisher.publish_restart_outcome(&outcome).await {
                error!("Failed to publish restart outcome for {}: {}", key, e);
            }
            outcome
        });

        Ok(TriggerOutcome::Started { attempt, handle })
    }

    /// Current phase of `key` as seen at `now`
    pub fn phase(&self, key: &ServiceKey, now: Timestamp) -> RestartPhase {
        let Some(slot) = self.existing(key) else {
            return RestartPhase::Idle;
        };
        if slot.guard.try_lock().is_err() {
            return RestartPhase::Restarting;
        }
        let state = slot.state.lock();
        if state.attempts >= self.policy.max_attempts {
            return RestartPhase::AttemptLimitReached;
        }
        match state.last_attempt {
            Some(last) if now - last < self.policy.cooldown() => RestartPhase::CooldownBlocked,
            _ => RestartPhase::Idle,
        }
    }

    pub fn attempts(&self, key: &ServiceKey) -> u32 {
        self.existing(key)
            .map(|slot| slot.state.lock().attempts)
            .unwrap_or(0)
    }

    /// Clear the attempt counter and cooldown of `key`, including the
    /// attempts reported in summaries
    pub fn reset(&self, key: &ServiceKey) {
        if let Some(slot) = self.existing(key) {
            *slot.state.lock() = RestartState::default();
            info!("Restart state reset for {}", key);
        }
        self.stats.reset_restart_attempts(key);
    }
}
