use crate::aggregator::{CategorySummary, OccurrenceSnapshot};
use crate::config::BusTopics;
use crate::error::BusError;
use crate::events::{FailureCategory, FailureEvent, RestartOutcome, Timestamp};
use crate::publish::MessageBus;
use crate::supervisor::ConnectivityReport;
use chrono::Utc;
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Longest a single publish may take before it is abandoned
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Wraps a payload with the `timestamp` and `source` every message carries
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    timestamp: Timestamp,
    source: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct PlanStatus<'a> {
    plan: &'a str,
}

#[derive(Serialize)]
struct PlanForward<'a> {
    plan: &'a str,
    mode: &'a str,
}

#[derive(Serialize)]
struct AudioStatus {
    processing_enabled: bool,
}

/// Publishes failure events, restart outcomes and periodic status to the bus
///
/// The publisher never retries: a failed publish is returned to the caller,
/// which logs it and carries on. Every publish is bounded by
/// `publish_timeout`, so monitoring does not stall on the bus.
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    topics: BusTopics,
    source: String,
    publish_timeout: Duration,
}

impl EventPublisher {
    /// Create a publisher
    ///
    /// # Arguments
    ///
    /// * `bus` - Transport the messages go out on
    /// * `topics` - Topic layout
    /// * `source` - Value of the `source` field of every message
    pub fn new(bus: Arc<dyn MessageBus>, topics: BusTopics, source: impl Into<String>) -> Self {
        Self {
            bus,
            topics,
            source: source.into(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn topics(&self) -> &BusTopics {
        &self.topics
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    async fn send<T: Serialize>(
        &self,
        topic: &str,
        body: &T,
        retain: bool,
    ) -> Result<(), BusError> {
        let envelope = Envelope {
            timestamp: Utc::now(),
            source: &self.source,
            body,
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.deliver(topic, payload, retain).await
    }

    async fn deliver(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        tokio::time::timeout(self.publish_timeout, self.bus.publish(topic, payload, retain))
            .await
            .map_err(|_| BusError::Timeout {
                topic: topic.to_string(),
                timeout: self.publish_timeout,
            })??;
        debug!("Published to {}", topic);
        Ok(())
    }

    /// Convert an occurrence into the externally published event
    pub fn failure_event(&self, occurrence: &OccurrenceSnapshot) -> FailureEvent {
        FailureEvent {
            system: occurrence.key.node.clone(),
            service: occurrence.key.service.clone(),
            category: occurrence.key.category,
            timestamp: occurrence.timestamp,
            log_line: occurrence.line.clone(),
            total_count: occurrence.total_count,
            recent_count: occurrence.recent_count,
            consecutive_overruns: match occurrence.key.category {
                FailureCategory::BufferOverrun => Some(occurrence.consecutive_failures),
                FailureCategory::Underrun => None,
            },
            spam_detected: occurrence.spam_detected,
            restart_attempts: occurrence.restart_attempts,
            source: self.source.clone(),
        }
    }

    /// Publish one classified failure
    ///
    /// Underruns go to the underrun topic, overruns to the encoder's overrun
    /// topic. The event already carries its own timestamp and source.
    pub async fn publish_failure(&self, occurrence: &OccurrenceSnapshot) -> Result<(), BusError> {
        let event = self.failure_event(occurrence);
        let topic = match event.category {
            FailureCategory::Underrun => self.topics.underruns.clone(),
            FailureCategory::BufferOverrun => self.topics.overrun_event(),
        };
        let payload = serde_json::to_vec(&event)?;
        self.deliver(&topic, payload, false).await
    }

    /// Publish the result of an executed restart
    pub async fn publish_restart_outcome(&self, outcome: &RestartOutcome) -> Result<(), BusError> {
        let payload = serde_json::to_vec(outcome)?;
        self.deliver(&self.topics.restart_outcome(), payload, false)
            .await?;
        info!(
            "Published restart {} for {}/{}",
            if outcome.is_success() { "success" } else { "failure" },
            outcome.system,
            outcome.service
        );
        Ok(())
    }

    /// Publish a category summary (retained)
    pub async fn publish_summary(&self, summary: &CategorySummary) -> Result<(), BusError> {
        let topic = match summary.category {
            FailureCategory::Underrun => self.topics.underrun_summary(),
            FailureCategory::BufferOverrun => self.topics.overrun_summary(),
        };
        self.send(&topic, summary, true).await?;
        info!(
            "{} summary - total: {}, recent: {}",
            summary.category.label(),
            summary.total_count,
            summary.recent_count
        );
        Ok(())
    }

    /// Publish fleet connectivity (retained)
    pub async fn publish_connectivity(&self, report: &ConnectivityReport) -> Result<(), BusError> {
        self.send(&self.topics.connectivity(), report, true).await
    }

    /// Publish the active plan on the status and plan topics (both retained)
    pub async fn publish_plan_status(&self, plan: &str) -> Result<(), BusError> {
        let status = PlanStatus { plan };
        self.send(&self.topics.status, &status, true).await?;
        self.send(&self.topics.plan, &status, true).await?;
        info!("Published plan status: {}", plan);
        Ok(())
    }

    /// Forward a plan broadcast to the edge nodes (retained)
    pub async fn forward_plan(&self, plan: &str, mode: &str) -> Result<(), BusError> {
        self.send(&self.topics.plan, &PlanForward { plan, mode }, true)
            .await?;
        info!("Forwarded plan {} (mode: {}) to sculptures", plan, mode);
        Ok(())
    }

    /// Publish whether the engine's audio processing is enabled (retained)
    pub async fn publish_audio_status(&self, enabled: bool) -> Result<(), BusError> {
        self.send(
            &self.topics.audio_status,
            &AudioStatus {
                processing_enabled: enabled,
            },
            true,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::StatsAggregator;
    use crate::events::{RestartStatus, RestartStrategy, StreamKey};
    use crate::publish::{MemoryBus, StalledBus};

    fn publisher() -> (Arc<MemoryBus>, EventPublisher) {
        let bus = Arc::new(MemoryBus::new());
        let publisher = EventPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            BusTopics::default(),
            "server-agent",
        );
        (bus, publisher)
    }

    fn occurrence(category: FailureCategory, service: &str) -> OccurrenceSnapshot {
        let stats = StatsAggregator::new(chrono::Duration::seconds(30), 10);
        stats.record_occurrence(
            &StreamKey::new("sculpture1", service, category),
            "buffer overrun",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_overrun_event_topic_and_payload() {
        let (bus, publisher) = publisher();
        publisher
            .publish_failure(&occurrence(FailureCategory::BufferOverrun, "darkice"))
            .await
            .unwrap();

        let json = bus.last_json("system/darkice/overrun").unwrap();
        assert_eq!(json["system"], "sculpture1");
        assert_eq!(json["consecutive_overruns"], 1);
        assert_eq!(json["source"], "server-agent");
        assert!(json["timestamp"].is_string());
        assert!(!bus.published()[0].retain);
    }

    #[tokio::test]
    async fn test_underrun_event_topic() {
        let (bus, publisher) = publisher();
        publisher
            .publish_failure(&occurrence(FailureCategory::Underrun, "player-live"))
            .await
            .unwrap();

        let json = bus.last_json("system/underruns").unwrap();
        assert_eq!(json["category"], "underrun");
        assert!(json.get("consecutive_overruns").is_none());
    }

    #[tokio::test]
    async fn test_summary_is_retained_with_envelope() {
        let (bus, publisher) = publisher();
        let stats = StatsAggregator::new(chrono::Duration::seconds(30), 10);
        stats.record_occurrence(
            &StreamKey::new("sculpture2", "player-loop", FailureCategory::Underrun),
            "audio underrun",
            Utc::now(),
        );
        let summary = stats.summary(
            FailureCategory::Underrun,
            Utc::now(),
            chrono::Duration::hours(1),
        );

        publisher.publish_summary(&summary).await.unwrap();

        let message = &bus.published_on("system/underruns/summary")[0];
        assert!(message.retain);
        let json = bus.last_json("system/underruns/summary").unwrap();
        assert_eq!(json["source"], "server-agent");
        assert_eq!(json["total_count"], 1);
        assert_eq!(json["systems"]["sculpture2"]["player-loop"]["total_count"], 1);
    }

    #[tokio::test]
    async fn test_plan_status_goes_to_status_and_plan() {
        let (bus, publisher) = publisher();
        publisher.publish_plan_status("B2").await.unwrap();

        assert_eq!(bus.last_json("system/status").unwrap()["plan"], "B2");
        assert_eq!(bus.last_json("system/plan").unwrap()["plan"], "B2");
        assert!(bus.published().iter().all(|m| m.retain));
    }

    #[tokio::test]
    async fn test_forward_plan() {
        let (bus, publisher) = publisher();
        publisher.forward_plan("C", "loop").await.unwrap();

        let json = bus.last_json("system/plan").unwrap();
        assert_eq!(json["plan"], "C");
        assert_eq!(json["mode"], "loop");
    }

    #[tokio::test]
    async fn test_restart_outcome() {
        let (bus, publisher) = publisher();
        let outcome = RestartOutcome {
            system: "sculpture1".to_string(),
            service: "darkice".to_string(),
            timestamp: Utc::now(),
            status: RestartStatus::Failure,
            strategy: None::<RestartStrategy>,
            attempt: 3,
            message: "all strategies failed".to_string(),
            source: "server-agent".to_string(),
        };
        publisher.publish_restart_outcome(&outcome).await.unwrap();

        let json = bus.last_json("system/darkice/restart").unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["attempt"], 3);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let (bus, publisher) = publisher();
        bus.set_failing(true);
        assert!(publisher.publish_audio_status(true).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_bus_times_out() {
        let bus = Arc::new(StalledBus::new());
        let publisher = EventPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            BusTopics::default(),
            "server-agent",
        )
        .with_publish_timeout(Duration::from_millis(20));

        let result = publisher
            .publish_failure(&occurrence(FailureCategory::BufferOverrun, "darkice"))
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert!(matches!(
            publisher.publish_plan_status("A1").await,
            Err(BusError::Timeout { .. })
        ));
        assert_eq!(bus.attempts(), 2);
    }
}
