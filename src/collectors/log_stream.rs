use crate::aggregator::OccurrenceSnapshot;
use crate::classifier::FailureClassifier;
use crate::error::StreamError;
use crate::events::StreamKey;
use crate::remote::session::RemoteShell;
use crate::BoxFuture;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Receives every classified failure occurrence
///
/// Called synchronously from the reader, so occurrences of one stream are
/// delivered in the order their lines were produced.
pub trait FailureSink: Send + Sync {
    fn on_failure(&self, occurrence: OccurrenceSnapshot) -> BoxFuture<'_, ()>;
}

/// Remote command following a service's log from now on
pub fn follow_command(service: &str) -> String {
    format!("journalctl -u {} -f -n 0 -o cat --no-hostname", service)
}

/// Log stream reader for one monitored (node, service, category) stream
///
/// Runs `journalctl -f` for the service over the node's session and feeds
/// every non-empty line through the classifier. The reader never reconnects on
/// its own: when the remote process ends or the transport fails it returns,
/// and the health supervisor decides when to start a replacement.
pub struct LogStreamReader {
    key: StreamKey,
    classifier: Arc<FailureClassifier>,
    sink: Arc<dyn FailureSink>,
    heartbeat_interval: Duration,
}

impl LogStreamReader {
    /// Create a reader
    ///
    /// # Arguments
    ///
    /// * `key` - Stream identity; the category selects the signature set
    /// * `classifier` - Shared classifier recording matches
    /// * `sink` - Receives the snapshot of every match
    /// * `heartbeat_interval` - Interval of the liveness log line
    pub fn new(
        key: StreamKey,
        classifier: Arc<FailureClassifier>,
        sink: Arc<dyn FailureSink>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            key,
            classifier,
            sink,
            heartbeat_interval,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Follow the service log until it ends, fails or shutdown is signalled
    ///
    /// # Returns
    ///
    /// `Ok(lines)` with the number of processed lines on shutdown
    ///
    /// # Errors
    ///
    /// * `StreamError::Start` - the follow command could not be started
    /// * `StreamError::Terminated` - the remote process exited
    /// * `StreamError::Io` - reading from the transport failed
    pub async fn run(
        &self,
        session: Arc<dyn RemoteShell>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, StreamError> {
        let command = follow_command(&self.key.service);
        let mut stream = session.stream(&command).await?;
        info!("Following {} via {}", self.key, session.address());

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // first tick completes immediately
        heartbeat.tick().await;

        let mut lines: u64 = 0;
        loop {
            tokio::select! {
                next = stream.next_line() => match next {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        lines += 1;
                        if let Some(occurrence) = self.classifier.classify(&self.key, line, Utc::now()) {
                            warn!(
                                "{} detected on {} (total {}): {}",
                                self.key.category.label(),
                                self.key.service_key(),
                                occurrence.total_count,
                                line
                            );
                            self.sink.on_failure(occurrence).await;
                        }
                    }
                    Ok(None) => {
                        warn!("Log follow for {} ended after {} lines", self.key, lines);
                        return Err(StreamError::Terminated {
                            node: self.key.node.clone(),
                            service: self.key.service.clone(),
                        });
                    }
                    Err(e) => {
                        warn!("Log follow for {} failed after {} lines: {}", self.key, lines, e);
                        return Err(StreamError::Io(e));
                    }
                },
                _ = heartbeat.tick() => {
                    info!("Heartbeat {}: {} lines processed", self.key, lines);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Stopping log follow for {}", self.key);
                        return Ok(lines);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::StatsAggregator;
    use crate::config::SignatureConfig;
    use crate::events::FailureCategory;
    use crate::remote::session::MockShell;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<OccurrenceSnapshot>>,
    }

    impl FailureSink for RecordingSink {
        fn on_failure(&self, occurrence: OccurrenceSnapshot) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.received.lock().push(occurrence);
            })
        }
    }

    fn reader(key: StreamKey, sink: Arc<RecordingSink>) -> LogStreamReader {
        let stats = Arc::new(StatsAggregator::new(chrono::Duration::seconds(30), 10));
        let classifier =
            Arc::new(FailureClassifier::from_config(&SignatureConfig::default(), stats).unwrap());
        LogStreamReader::new(key, classifier, sink, Duration::from_secs(30))
    }

    #[test]
    fn test_follow_command() {
        assert_eq!(
            follow_command("darkice"),
            "journalctl -u darkice -f -n 0 -o cat --no-hostname"
        );
    }

    #[tokio::test]
    async fn test_reader_classifies_in_order_and_ends() {
        let shell = Arc::new(MockShell::new("sculpture1", "sculpture1.local"));
        shell.script_stream(
            &follow_command("darkice"),
            &[
                "Using I/O: ALSA",
                "",
                "buffer overrun (1)",
                "   ",
                "BUFFER OVERRUN (2)",
                "encoding",
            ],
            false,
        );
        let sink = Arc::new(RecordingSink::default());
        let key = StreamKey::new("sculpture1", "darkice", FailureCategory::BufferOverrun);
        let reader = reader(key, Arc::clone(&sink));
        let (_tx, rx) = watch::channel(false);

        let result = reader.run(shell, rx).await;
        assert!(matches!(result, Err(StreamError::Terminated { .. })));

        let received = sink.received.lock();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].line, "buffer overrun (1)");
        assert_eq!(received[1].line, "BUFFER OVERRUN (2)");
        assert_eq!(received[1].consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_reader_reports_io_error() {
        let shell = Arc::new(MockShell::new("sculpture2", "sculpture2.local"));
        shell.script_broken_stream(&follow_command("player-live"), &["audio underrun"]);
        let sink = Arc::new(RecordingSink::default());
        let key = StreamKey::new("sculpture2", "player-live", FailureCategory::Underrun);

        let (_tx, rx) = watch::channel(false);
        let result = reader(key, Arc::clone(&sink)).run(shell, rx).await;

        assert!(matches!(result, Err(StreamError::Io(_))));
        assert_eq!(sink.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reader_fails_to_start_on_dead_session() {
        let shell = Arc::new(MockShell::new("sculpture2", "sculpture2.local"));
        shell.set_alive(false);
        let sink = Arc::new(RecordingSink::default());
        let key = StreamKey::new("sculpture2", "player-live", FailureCategory::Underrun);

        let (_tx, rx) = watch::channel(false);
        let result = reader(key, sink).run(shell, rx).await;
        assert!(matches!(result, Err(StreamError::Start(_))));
    }

    #[tokio::test]
    async fn test_reader_stops_on_shutdown() {
        let shell = Arc::new(MockShell::new("sculpture3", "sculpture3.local"));
        shell.script_stream(&follow_command("player-loop"), &["Playing loop.flac"], true);
        let sink = Arc::new(RecordingSink::default());
        let key = StreamKey::new("sculpture3", "player-loop", FailureCategory::Underrun);
        let reader = reader(key, sink);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { reader.run(shell, rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        let lines = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lines, 1);
    }
}
