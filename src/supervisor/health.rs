use crate::classifier::FailureClassifier;
use crate::collectors::{FailureSink, LogStreamReader};
use crate::config::{Config, FleetConfig};
use crate::error::{SessionError, StreamError};
use crate::events::{FailureCategory, StreamKey, Timestamp};
use crate::publish::EventPublisher;
use crate::remote::{NodeConnectivity, RemoteShell, SessionPool};
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Fleet connectivity as published on the connectivity topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityReport {
    pub connected: usize,
    pub total: usize,
    pub nodes: Vec<NodeConnectivity>,
}

impl ConnectivityReport {
    pub fn from_nodes(nodes: Vec<NodeConnectivity>) -> Self {
        Self {
            connected: nodes.iter().filter(|n| n.connected).count(),
            total: nodes.len(),
            nodes,
        }
    }

    pub fn connected_nodes(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| n.connected)
            .map(|n| n.node.clone())
            .collect()
    }
}

/// Every monitored stream of the fleet
///
/// Each node gets an underrun stream per player service and an overrun
/// stream per encoder service.
pub fn stream_keys(fleet: &FleetConfig) -> Vec<StreamKey> {
    let mut keys = Vec::new();
    for node in &fleet.nodes {
        for service in &fleet.underrun_services {
            keys.push(StreamKey::new(
                node.name.clone(),
                service.clone(),
                FailureCategory::Underrun,
            ));
        }
        for service in &fleet.overrun_services {
            keys.push(StreamKey::new(
                node.name.clone(),
                service.clone(),
                FailureCategory::BufferOverrun,
            ));
        }
    }
    keys
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Interval between audits
    pub interval: Duration,
    /// Back-off before a dead stream is reconnected
    pub retry_interval: chrono::Duration,
    /// Bound of one connection attempt to one address
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.supervisor.interval(),
            retry_interval: config.connection.retry_backoff(),
            connect_timeout: config.connection.connect_timeout(),
            heartbeat_interval: config.connection.heartbeat_interval(),
        }
    }
}

type ReaderTask = JoinHandle<Result<u64, StreamError>>;

#[derive(Default)]
struct StreamHandle {
    task: Option<ReaderTask>,
    /// Earliest time a dead stream may be restarted; `None` means now
    next_retry_at: Option<Timestamp>,
}

/// Owns every log reader task and brings dead streams back
///
/// A stream is dead when its task has finished. Audits reconnect dead streams
/// whose back-off has elapsed, one task per node so a hung node cannot delay
/// the others.
pub struct HealthSupervisor {
    pool: Arc<SessionPool>,
    classifier: Arc<FailureClassifier>,
    sink: Arc<dyn FailureSink>,
    publisher: Arc<EventPublisher>,
    settings: SupervisorSettings,
    streams: Mutex<BTreeMap<StreamKey, StreamHandle>>,
    last_connected: Mutex<Option<BTreeSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

impl HealthSupervisor {
    /// Create a supervisor for `keys`
    ///
    /// # Arguments
    ///
    /// * `pool` - Session pool the readers run on
    /// * `classifier` - Shared by every reader
    /// * `sink` - Receives every classified occurrence
    /// * `publisher` - Connectivity reports go out here
    /// * `keys` - Streams to supervise
    /// * `shutdown` - Handed to every reader; the audit loop stops on it too
    pub fn new(
        pool: Arc<SessionPool>,
        classifier: Arc<FailureClassifier>,
        sink: Arc<dyn FailureSink>,
        publisher: Arc<EventPublisher>,
        settings: SupervisorSettings,
        keys: Vec<StreamKey>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let streams = keys
            .into_iter()
            .map(|key| (key, StreamHandle::default()))
            .collect();
        Self {
            pool,
            classifier,
            sink,
            publisher,
            settings,
            streams: Mutex::new(streams),
            last_connected: Mutex::new(None),
            shutdown,
        }
    }

    /// Register every stream with the statistics and start them
    pub async fn start(&self) -> ConnectivityReport {
        let keys: Vec<StreamKey> = self.streams.lock().keys().cloned().collect();
        for key in &keys {
            self.classifier.stats().register(key);
        }
        info!("Starting {} log streams", keys.len());
        self.audit(Utc::now()).await
    }

    /// Number of streams whose reader task is still running
    pub fn live_streams(&self) -> usize {
        self.streams
            .lock()
            .values()
            .filter(|h| h.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .count()
    }

    pub fn is_running(&self, key: &StreamKey) -> bool {
        self.streams
            .lock()
            .get(key)
            .and_then(|h| h.task.as_ref())
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Reap finished readers and reconnect dead streams that are due
    pub async fn audit(&self, now: Timestamp) -> ConnectivityReport {
        self.reap(now).await;

        let due = self.due_streams(now);
        if !due.is_empty() {
            let attempts: Vec<_> = due
                .into_iter()
                .map(|(node, keys)| {
                    let pool = Arc::clone(&self.pool);
                    let bound = self.acquire_bound(&node);
                    tokio::spawn(async move {
                        let result = match tokio::time::timeout(bound, pool.acquire(&node)).await {
                            Ok(result) => result,
                            Err(_) => Err(SessionError::Timeout(bound)),
                        };
                        (node, keys, result)
                    })
                })
                .collect();

            for attempt in attempts {
                match attempt.await {
                    Ok((node, keys, Ok(session))) => self.spawn_readers(&node, keys, session),
                    Ok((node, keys, Err(e))) => {
                        error!("Failed to connect to {}: {}", node, e);
                        self.schedule_retry(&keys, now);
                    }
                    Err(e) => error!("Reconnect task failed: {}", e),
                }
            }
        }

        let report = ConnectivityReport::from_nodes(self.pool.connectivity());
        info!(
            "Connection status: {}/{} systems connected",
            report.connected, report.total
        );
        self.publish_if_changed(&report).await;
        report
    }

    /// Time allowed to connect one node, covering each candidate address once
    fn acquire_bound(&self, node: &str) -> Duration {
        let candidates = self
            .pool
            .nodes()
            .iter()
            .find(|n| n.name == node)
            .map(|n| n.hosts.len())
            .unwrap_or(1)
            .max(1);
        self.settings.connect_timeout * u32::try_from(candidates).unwrap_or(u32::MAX)
            + self.pool.settings().probe_timeout
    }

    async fn reap(&self, now: Timestamp) {
        let finished: Vec<(StreamKey, ReaderTask)> = {
            let mut streams = self.streams.lock();
            streams
                .iter_mut()
                .filter(|(_, h)| h.task.as_ref().map(|t| t.is_finished()).unwrap_or(false))
                .filter_map(|(key, h)| {
                    h.next_retry_at = Some(now + self.settings.retry_interval);
                    h.task.take().map(|t| (key.clone(), t))
                })
                .collect()
        };

        for (key, task) in finished {
            match task.await {
                Ok(Ok(lines)) => debug!("Stream {} stopped after {} lines", key, lines),
                Ok(Err(e)) => warn!("Stream {} is dead: {}", key, e),
                Err(e) => error!("Reader task for {} panicked: {}", key, e),
            }
        }
    }

    fn due_streams(&self, now: Timestamp) -> BTreeMap<String, Vec<StreamKey>> {
        let streams = self.streams.lock();
        let mut due: BTreeMap<String, Vec<StreamKey>> = BTreeMap::new();
        for (key, handle) in streams.iter() {
            let waiting = handle.next_retry_at.map(|at| at > now).unwrap_or(false);
            if handle.task.is_none() && !waiting {
                due.entry(key.node.clone()).or_default().push(key.clone());
            }
        }
        due
    }

    fn schedule_retry(&self, keys: &[StreamKey], now: Timestamp) {
        let mut streams = self.streams.lock();
        for key in keys {
            if let Some(handle) = streams.get_mut(key) {
                handle.next_retry_at = Some(now + self.settings.retry_interval);
            }
        }
    }

    fn spawn_readers(&self, node: &str, keys: Vec<StreamKey>, session: Arc<dyn RemoteShell>) {
        let mut streams = self.streams.lock();
        for key in keys {
            let reader = LogStreamReader::new(
                key.clone(),
                Arc::clone(&self.classifier),
                Arc::clone(&self.sink),
                self.settings.heartbeat_interval,
            );
            let session = Arc::clone(&session);
            let pool = Arc::clone(&self.pool);
            let shutdown = self.shutdown.clone();
            let task = tokio::spawn(async move {
                let result = reader.run(session, shutdown).await;
                if let Err(StreamError::Io(_)) = &result {
                    pool.invalidate(&reader.key().node).await;
                }
                result
            });

            info!("Started monitoring {} on {}", key, node);
            if let Some(handle) = streams.get_mut(&key) {
                handle.task = Some(task);
                handle.next_retry_at = None;
            }
        }
    }

    async fn publish_if_changed(&self, report: &ConnectivityReport) {
        let connected = report.connected_nodes();
        let changed = {
            let mut last = self.last_connected.lock();
            if last.as_ref() == Some(&connected) {
                false
            } else {
                *last = Some(connected);
                true
            }
        };
        if changed {
            if let Err(e) = self.publisher.publish_connectivity(report).await {
                error!("Failed to publish connectivity: {}", e);
            }
        }
    }

    /// Audit every `interval` until shutdown
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately; start() already audited
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.audit(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health supervisor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Wait for readers to observe shutdown, aborting the ones that do not
    pub async fn stop_streams(&self, grace: Duration) {
        let tasks: Vec<(StreamKey, ReaderTask)> = self
            .streams
            .lock()
            .iter_mut()
            .filter_map(|(key, h)| h.task.take().map(|t| (key.clone(), t)))
            .collect();

        for (key, task) in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Reader for {} did not stop in time, aborting", key);
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{OccurrenceSnapshot, StatsAggregator};
    use crate::collectors::follow_command;
    use crate::config::{BusTopics, FleetNode, SignatureConfig};
    use crate::publish::{MemoryBus, MessageBus};
    use crate::remote::{MockConnector, MockShell, PoolSettings, SessionConnector};
    use crate::BoxFuture;

    #[derive(Default)]
    struct CountingSink {
        received: Mutex<Vec<OccurrenceSnapshot>>,
    }

    impl FailureSink for CountingSink {
        fn on_failure(&self, occurrence: OccurrenceSnapshot) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.received.lock().push(occurrence);
            })
        }
    }

    struct Harness {
        connector: Arc<MockConnector>,
        bus: Arc<MemoryBus>,
        sink: Arc<CountingSink>,
        supervisor: HealthSupervisor,
        shutdown: watch::Sender<bool>,
    }

    fn fleet() -> FleetConfig {
        FleetConfig {
            nodes: vec![
                FleetNode::new("sculpture1", &["sculpture1.local", "10.0.0.11"]),
                FleetNode::new("sculpture2", &["sculpture2.local"]),
            ],
            underrun_services: vec!["player-live".to_string()],
            overrun_services: vec!["darkice".to_string()],
        }
    }

    fn harness() -> Harness {
        let fleet = fleet();
        let connector = Arc::new(MockConnector::new());
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&connector) as Arc<dyn SessionConnector>,
            fleet.nodes.clone(),
            PoolSettings {
                connect_timeout: Duration::from_millis(200),
                probe: true,
                probe_timeout: Duration::from_millis(200),
                verify_services: false,
                services: fleet.all_services(),
            },
        ));
        let stats = Arc::new(StatsAggregator::new(chrono::Duration::seconds(30), 10));
        let classifier =
            Arc::new(FailureClassifier::from_config(&SignatureConfig::default(), stats).unwrap());
        let bus = Arc::new(MemoryBus::new());
        let publisher = Arc::new(EventPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            BusTopics::default(),
            "server-agent",
        ));
        let sink = Arc::new(CountingSink::default());
        let (tx, rx) = watch::channel(false);
        let supervisor = HealthSupervisor::new(
            pool,
            classifier,
            Arc::clone(&sink) as Arc<dyn FailureSink>,
            publisher,
            SupervisorSettings {
                interval: Duration::from_secs(60),
                retry_interval: chrono::Duration::seconds(30),
                connect_timeout: Duration::from_millis(200),
                heartbeat_interval: Duration::from_secs(30),
            },
            stream_keys(&fleet),
            rx,
        );
        Harness {
            connector,
            bus,
            sink,
            supervisor,
            shutdown: tx,
        }
    }

    fn hold_open(shell: &MockShell, services: &[&str]) {
        for service in services {
            shell.script_stream(&follow_command(service), &[], true);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_stream_keys() {
        let keys = stream_keys(&fleet());
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&StreamKey::new(
            "sculpture2",
            "darkice",
            FailureCategory::BufferOverrun
        )));
        assert!(keys.contains(&StreamKey::new(
            "sculpture1",
            "player-live",
            FailureCategory::Underrun
        )));
    }

    #[tokio::test]
    async fn test_start_connects_every_node() {
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        let s2 = h.connector.add_shell("sculpture2", "sculpture2.local");
        hold_open(&s1, &["player-live", "darkice"]);
        hold_open(&s2, &["player-live", "darkice"]);

        let report = h.supervisor.start().await;
        settle().await;

        assert_eq!(report.connected, 2);
        assert_eq!(report.total, 2);
        assert_eq!(h.supervisor.live_streams(), 4);
        assert_eq!(s1.streams_started(), 2);
        assert_eq!(s2.streams_started(), 2);

        let json = h.bus.last_json("system/underruns/connectivity").unwrap();
        assert_eq!(json["connected"], 2);
        assert_eq!(json["source"], "server-agent");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_isolated() {
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        hold_open(&s1, &["player-live", "darkice"]);

        let report = h.supervisor.start().await;
        settle().await;

        assert_eq!(report.connected, 1);
        assert_eq!(h.supervisor.live_streams(), 2);
        assert!(!h.supervisor.is_running(&StreamKey::new(
            "sculpture2",
            "darkice",
            FailureCategory::BufferOverrun
        )));
    }

    #[tokio::test]
    async fn test_hanging_node_does_not_block_other_nodes() {
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        h.connector.add_shell("sculpture2", "sculpture2.local");
        h.connector
            .set_connect_delay("sculpture2.local", Duration::from_secs(3600));
        hold_open(&s1, &["player-live"]);
        s1.script_stream(&follow_command("darkice"), &[], false);
        hold_open(&s1, &["darkice"]);

        let start = Utc::now();
        let report = tokio::time::timeout(Duration::from_secs(2), h.supervisor.start())
            .await
            .expect("start blocked on a hanging node");
        settle().await;
        assert_eq!(report.connected, 1);
        assert!(report.connected_nodes().contains("sculpture1"));

        h.supervisor.audit(start + chrono::Duration::seconds(1)).await;
        let began = std::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(2),
            h.supervisor.audit(start + chrono::Duration::seconds(32)),
        )
        .await
        .expect("audit blocked on a hanging node");
        settle().await;

        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(h.supervisor.is_running(&StreamKey::new(
            "sculpture1",
            "darkice",
            FailureCategory::BufferOverrun
        )));
        assert!(!h.supervisor.is_running(&StreamKey::new(
            "sculpture2",
            "darkice",
            FailureCategory::BufferOverrun
        )));
        assert_eq!(s1.streams_started(), 3);
    }

    #[tokio::test]
    async fn test_dead_stream_restarted_after_retry_interval() {
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        let s2 = h.connector.add_shell("sculpture2", "sculpture2.local");
        hold_open(&s1, &["player-live"]);
        // darkice on sculpture1 ends right away, after one overrun
        s1.script_stream(&follow_command("darkice"), &["buffer overrun"], false);
        hold_open(&s1, &["darkice"]);
        hold_open(&s2, &["player-live", "darkice"]);

        let start = Utc::now();
        h.supervisor.start().await;
        settle().await;
        let darkice = StreamKey::new("sculpture1", "darkice", FailureCategory::BufferOverrun);
        assert!(!h.supervisor.is_running(&darkice));
        assert_eq!(h.sink.received.lock().len(), 1);

        // reaped now, but not due before the retry interval
        h.supervisor.audit(start + chrono::Duration::seconds(1)).await;
        assert!(!h.supervisor.is_running(&darkice));

        h.supervisor
            .audit(start + chrono::Duration::seconds(32))
            .await;
        settle().await;
        assert!(h.supervisor.is_running(&darkice));
        assert_eq!(s1.streams_started(), 3);
    }

    #[tokio::test]
    async fn test_io_error_invalidates_session() {
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        let s2 = h.connector.add_shell("sculpture2", "sculpture2.local");
        s1.script_broken_stream(&follow_command("player-live"), &[]);
        hold_open(&s1, &["darkice"]);
        hold_open(&s2, &["player-live", "darkice"]);

        h.supervisor.start().await;
        settle().await;

        assert!(s1.is_closed());
        let report = ConnectivityReport::from_nodes(h.supervisor.pool.connectivity());
        assert_eq!(report.connected_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_published_only_on_change() {
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        hold_open(&s1, &["player-live", "darkice"]);

        let start = Utc::now();
        h.supervisor.start().await;
        h.supervisor.audit(start).await;
        assert_eq!(
            h.bus.published_on("system/underruns/connectivity").len(),
            1
        );

        let s2 = h.connector.add_shell("sculpture2", "sculpture2.local");
        hold_open(&s2, &["player-live", "darkice"]);
        let report = h
            .supervisor
            .audit(start + chrono::Duration::seconds(31))
            .await;
        assert_eq!(report.connected, 2);
        assert_eq!(
            h.bus.published_on("system/underruns/connectivity").len(),
            2
        );
    }

    #[tokio::test]
    async fn test_stop_streams_on_shutdown() {
        let fleet = fleet();
        let h = harness();
        let s1 = h.connector.add_shell("sculpture1", "sculpture1.local");
        let s2 = h.connector.add_shell("sculpture2", "sculpture2.local");
        hold_open(&s1, &["player-live", "darkice"]);
        hold_open(&s2, &["player-live", "darkice"]);
        h.supervisor.start().await;
        assert_eq!(h.supervisor.live_streams(), stream_keys(&fleet).len());

        h.shutdown.send(true).unwrap();
        h.supervisor.stop_streams(Duration::from_secs(1)).await;
        assert_eq!(h.supervisor.live_streams(), 0);
    }
}
