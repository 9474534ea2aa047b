//! Wiring of the monitoring pipeline and the bus-facing control loops
//!
//! The coordinator owns every long-lived component. Detected failures flow
//! from the readers into [`FailureHandler`], which decides on restarts and
//! then publishes them. Inbound bus messages are decoded once and dispatched here.

use crate::aggregator::{OccurrenceSnapshot, StatsAggregator};
use crate::classifier::FailureClassifier;
use crate::collectors::FailureSink;
use crate::config::Config;
use crate::engine::{EngineClient, PlanManager, PlanStore};
use crate::error::{ConfigError, PlanError, RestartError};
use crate::events::{FailureCategory, ServiceKey};
use crate::local_services::LocalServiceController;
use crate::publish::{
    AudioCommand, BusMessage, EventPublisher, InboundMessage, MessageBus, PlanBroadcast,
    ServerCommand,
};
use crate::remote::{PoolSettings, SessionConnector, SessionPool};
use crate::restart::{ExecutorSettings, RestartController, RestartExecutor, TriggerOutcome};
use crate::supervisor::{stream_keys, HealthSupervisor, SupervisorSettings};
use crate::BoxFuture;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Grace period for readers to exit on shutdown
const STREAM_STOP_GRACE: Duration = Duration::from_secs(5);

/// Publishes every occurrence and triggers overrun restarts
pub struct FailureHandler {
    publisher: Arc<EventPublisher>,
    restarts: Arc<RestartController>,
    overrun_threshold: u32,
}

impl FailureHandler {
    pub fn new(
        publisher: Arc<EventPublisher>,
        restarts: Arc<RestartController>,
        overrun_threshold: u32,
    ) -> Self {
        Self {
            publisher,
            restarts,
            overrun_threshold,
        }
    }

    /// Whether an occurrence calls for a restart of its service
    pub fn should_restart(&self, occurrence: &OccurrenceSnapshot) -> bool {
        occurrence.key.category == FailureCategory::BufferOverrun
            && (occurrence.consecutive_failures >= self.overrun_threshold
                || occurrence.spam_detected)
    }

    async fn handle(&self, occurrence: OccurrenceSnapshot) {
        if occurrence.spam_newly_detected {
            warn!(
                "{} spam detected on {}: {} occurrences in window",
                occurrence.key.category.label(),
                occurrence.key.service_key(),
                occurrence.recent_count
            );
        }
        if self.should_restart(&occurrence) {
            self.trigger_restart(&occurrence);
        }
        if let Err(e) = self.publisher.publish_failure(&occurrence).await {
            error!("Failed to publish {} event: {}", occurrence.key, e);
        }
    }

    fn trigger_restart(&self, occurrence: &OccurrenceSnapshot) {
        let key = occurrence.key.service_key();
        match self.restarts.trigger(&key, occurrence.timestamp) {
            Ok(TriggerOutcome::Started { attempt, .. }) => {
                info!(
                    "Triggered restart of {} after {} consecutive overruns (attempt {})",
                    key, occurrence.consecutive_failures, attempt
                );
            }
            Ok(TriggerOutcome::AlreadyInFlight) => {}
            Err(RestartError::CooldownBlocked { .. }) => {
                debug!("Restart of {} suppressed by cooldown", key);
            }
            Err(e) => warn!("Restart of {} rejected: {}", key, e),
        }
    }
}

impl FailureSink for FailureHandler {
    fn on_failure(&self, occurrence: OccurrenceSnapshot) -> BoxFuture<'_, ()> {
        Box::pin(self.handle(occurrence))
    }
}

/// The central coordinator
pub struct Coordinator {
    config: Config,
    stats: Arc<StatsAggregator>,
    publisher: Arc<EventPublisher>,
    pool: Arc<SessionPool>,
    restarts: Arc<RestartController>,
    supervisor: Arc<HealthSupervisor>,
    plans: Arc<PlanManager>,
    engine: Arc<dyn EngineClient>,
    local: Arc<LocalServiceController>,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    /// Build every component from `config`
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `bus` - Outbound transport
    /// * `connector` - Opens remote sessions to fleet nodes
    /// * `engine` - Mixing engine control client
    /// * `local` - Restarts of coordinator-host services
    /// * `shutdown` - Flips to `true` once on shutdown
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a failure signature does not compile
    pub fn new(
        config: Config,
        bus: Arc<dyn MessageBus>,
        connector: Arc<dyn SessionConnector>,
        engine: Arc<dyn EngineClient>,
        local: LocalServiceController,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        let publisher = Arc::new(EventPublisher::new(
            bus,
            config.bus.topics.clone(),
            config.bus.source.clone(),
        ));
        let stats = Arc::new(StatsAggregator::new(
            config.restart.spam_window(),
            config.restart.spam_threshold,
        ));
        let classifier = Arc::new(FailureClassifier::from_config(
            &config.signatures,
            Arc::clone(&stats),
        )?);

        let pool = Arc::new(SessionPool::new(
            connector,
            config.fleet.nodes.clone(),
            PoolSettings::from_config(&config.connection, config.fleet.all_services()),
        ));
        let executor = RestartExecutor::new(
            Arc::clone(&pool),
            ExecutorSettings::from_policy(&config.restart),
        );
        let restarts = Arc::new(RestartController::new(
            Arc::new(executor),
            Arc::clone(&stats),
            Arc::clone(&publisher),
            config.restart.clone(),
        ));

        let handler = Arc::new(FailureHandler::new(
            Arc::clone(&publisher),
            Arc::clone(&restarts),
            config.restart.overrun_threshold,
        ));
        let supervisor = Arc::new(HealthSupervisor::new(
            Arc::clone(&pool),
            classifier,
            handler,
            Arc::clone(&publisher),
            SupervisorSettings::from_config(&config),
            stream_keys(&config.fleet),
            shutdown.clone(),
        ));

        let plans = Arc::new(PlanManager::new(
            Arc::clone(&engine),
            PlanStore::new(&config.plan.state_file),
            Arc::clone(&publisher),
            &config.plan.default_plan,
        ));

        Ok(Self {
            config,
            stats,
            publisher,
            pool,
            restarts,
            supervisor,
            plans,
            engine,
            local: Arc::new(local),
            shutdown,
        })
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn restarts(&self) -> &Arc<RestartController> {
        &self.restarts
    }

    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        &self.supervisor
    }

    pub fn plans(&self) -> &Arc<PlanManager> {
        &self.plans
    }

    /// Decode and dispatch one inbound message; errors are logged
    pub async fn handle_message(&self, message: &BusMessage) {
        match InboundMessage::decode(&self.config.bus.topics, &message.topic, &message.payload) {
            Ok(inbound) => self.dispatch(inbound).await,
            Err(e) => warn!("Dropping inbound message: {}", e),
        }
    }

    pub async fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::Command(command) => self.handle_command(command).await,
            InboundMessage::Broadcast(broadcast) => self.handle_broadcast(broadcast).await,
            InboundMessage::Audio(command) => self.handle_audio(command).await,
        }
    }

    async fn handle_command(&self, command: ServerCommand) {
        match command {
            ServerCommand::RestartLocal { service } => {
                if let Err(e) = self.local.restart(&service).await {
                    error!("{}", e);
                    return;
                }
                if self.local.requires_plan_resync(&service) {
                    tokio::time::sleep(self.local.resync_delay()).await;
                    if let Err(e) = self.plans.resync().await {
                        error!("Failed to re-sync plan after {} restart: {}", service, e);
                    }
                }
            }
            ServerCommand::UnderrunSummary => {
                info!("Underrun summary requested");
                self.publish_summary(FailureCategory::Underrun).await;
            }
            ServerCommand::OverrunSummary => {
                info!("Overrun summary requested");
                self.publish_summary(FailureCategory::BufferOverrun).await;
            }
            ServerCommand::RemoteRestart { system, service } => {
                if !self.config.fleet.nodes.iter().any(|n| n.name == system) {
                    warn!("Restart requested for unknown system {}", system);
                    return;
                }
                let key = ServiceKey::new(system, service);
                info!("Manual restart requested for {}", key);
                match self.restarts.trigger(&key, Utc::now()) {
                    Ok(TriggerOutcome::Started { attempt, .. }) => {
                        info!("Manual restart of {} started (attempt {})", key, attempt)
                    }
                    Ok(TriggerOutcome::AlreadyInFlight) => {}
                    Err(e) => warn!("Manual restart of {} rejected: {}", key, e),
                }
            }
        }
    }

    async fn handle_broadcast(&self, broadcast: PlanBroadcast) {
        info!(
            "Received plan broadcast: {} (mode: {})",
            broadcast.plan, broadcast.mode
        );
        match self.plans.apply(&broadcast.plan).await {
            Err(PlanError::Invalid(plan)) => {
                warn!("Invalid plan: {}", plan);
                return;
            }
            Err(e) => error!("Failed to set plan in engine: {}", e),
            Ok(_) => {}
        }
        if let Err(e) = self
            .publisher
            .forward_plan(&broadcast.plan, &broadcast.mode)
            .await
        {
            error!("Failed to forward plan to sculptures: {}", e);
        }
    }

    async fn handle_audio(&self, command: AudioCommand) {
        match command {
            AudioCommand::ProcessingToggle(enable) => {
                info!(
                    "Audio processing toggle: {}",
                    if enable { "enable" } else { "disable" }
                );
                match self.engine.set_processing(enable).await {
                    Ok(response) => {
                        info!("Engine response: {}", response);
                        self.publish_audio_status().await;
                    }
                    Err(e) => error!("Failed to toggle audio processing: {}", e),
                }
            }
            AudioCommand::GetProcessingStatus => self.publish_audio_status().await,
            AudioCommand::Reset => match self.engine.reset_audio().await {
                Ok(response) => {
                    info!("Audio reset response: {}", response);
                    self.publish_audio_status().await;
                }
                Err(e) => error!("Failed to reset audio processing: {}", e),
            },
            AudioCommand::SetParameters(parameters) => {
                for (parameter, value) in parameters {
                    match self.engine.set_parameter(&parameter, &value).await {
                        Ok(response) => info!("Set {} to {}: {}", parameter, value, response),
                        Err(e) => error!("Failed to set {} to {}: {}", parameter, value, e),
                    }
                }
            }
        }
    }

    async fn publish_audio_status(&self) {
        match self.engine.processing_enabled().await {
            Ok(enabled) => {
                if let Err(e) = self.publisher.publish_audio_status(enabled).await {
                    error!("Failed to publish audio processing status: {}", e);
                }
            }
            Err(e) => error!("Failed to get audio processing status: {}", e),
        }
    }

    async fn publish_summary(&self, category: FailureCategory) {
        let summary = self.stats.summary(
            category,
            Utc::now(),
            self.config.supervisor.summary_horizon(),
        );
        if let Err(e) = self.publisher.publish_summary(&summary).await {
            error!("Failed to publish {} summary: {}", category.label(), e);
        }
    }

    /// One pass of the periodic status publisher
    pub async fn publish_status(&self) {
        match self.plans.reconcile().await {
            Ok(Some(plan)) => info!("Adopted engine plan {}", plan),
            Ok(None) => {}
            Err(e) => warn!("Plan reconciliation failed: {}", e),
        }
        self.plans.publish_status().await;
        self.publish_audio_status().await;
        self.publish_summary(FailureCategory::Underrun).await;
        self.publish_summary(FailureCategory::BufferOverrun).await;
    }

    async fn run_status(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.supervisor.status_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_status().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_inbound(&self, mut inbound: mpsc::Receiver<BusMessage>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_message(&message).await,
                    None => {
                        warn!("Inbound message channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Start monitoring and serve until shutdown, then release every session
    pub async fn run(self: Arc<Self>, inbound: mpsc::Receiver<BusMessage>) {
        info!(
            "Starting coordinator for {} systems (plan: {})",
            self.config.fleet.nodes.len(),
            self.plans.current()
        );
        self.plans.publish_status().await;
        self.supervisor.start().await;

        let supervisor = Arc::clone(&self.supervisor);
        let audits = tokio::spawn(async move { supervisor.run().await });
        let status = {
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move { coordinator.run_status().await })
        };

        self.run_inbound(inbound).await;

        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down coordinator");
        for (name, task) in [("supervisor", audits), ("status", status)] {
            if let Err(e) = task.await {
                error!("{} task failed: {}", name, e);
            }
        }
        self.supervisor.stop_streams(STREAM_STOP_GRACE).await;
        self.pool.close_all().await;
    }
}
