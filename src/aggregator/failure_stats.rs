//! Per-stream failure statistics with bounded rolling windows
//!
//! Every monitored (node, service, category) stream owns one `FailureStats`
//! entry behind its own lock. Writers (the classifier of that stream and the
//! restart controller) and readers (summary requests) only ever contend on a
//! single entry, and summaries copy each entry under its lock so they never
//! observe a half-updated window.

use crate::events::{FailureCategory, ServiceKey, StreamKey, Timestamp};
use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Capacity of the restart attempt history
pub const RESTART_HISTORY_CAPACITY: usize = 50;

/// One matched log line
#[derive(Debug, Clone, PartialEq)]
pub struct Occurrence {
    pub timestamp: Timestamp,
    pub line: String,
}

/// Mutable statistics of one monitored stream
#[derive(Debug, Clone)]
pub struct FailureStats {
    total_count: u64,
    last_occurrence: Option<Timestamp>,
    window: VecDeque<Occurrence>,
    capacity: usize,
    consecutive_failures: u32,
    spam_detected: bool,
    restart_attempts: u32,
    restart_history: VecDeque<Timestamp>,
}

impl FailureStats {
    pub fn new(category: FailureCategory) -> Self {
        let capacity = category.window_capacity();
        Self {
            total_count: 0,
            last_occurrence: None,
            window: VecDeque::with_capacity(capacity),
            capacity,
            consecutive_failures: 0,
            spam_detected: false,
            restart_attempts: 0,
            restart_history: VecDeque::with_capacity(RESTART_HISTORY_CAPACITY),
        }
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn spam_detected(&self) -> bool {
        self.spam_detected
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    fn push(&mut self, occurrence: Occurrence) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(occurrence);
    }

    fn count_since(&self, cutoff: Timestamp) -> usize {
        self.window.iter().filter(|o| o.timestamp > cutoff).count()
    }
}

/// State of a stream right after an occurrence was recorded
///
/// Carries everything the failure sink needs to publish the event and decide
/// whether a restart should be triggered.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceSnapshot {
    pub key: StreamKey,
    pub timestamp: Timestamp,
    pub line: String,
    pub total_count: u64,
    pub consecutive_failures: u32,
    /// Occurrences inside the spam window, including this one
    pub recent_count: usize,
    pub spam_detected: bool,
    /// True only for the occurrence that latched the spam flag
    pub spam_newly_detected: bool,
    pub restart_attempts: u32,
}

/// Read-only view of one stream, as published in summaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub total_count: u64,
    /// Occurrences within the summary horizon
    pub recent_count: usize,
    pub last_occurrence: Option<Timestamp>,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub last_restart_attempt: Option<Timestamp>,
    pub spam_detected: bool,
}

/// Fleet-wide summary for one failure category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: FailureCategory,
    pub generated_at: Timestamp,
    /// node → service → summary
    pub systems: BTreeMap<String, BTreeMap<String, ServiceSummary>>,
    pub total_count: u64,
    pub recent_count: usize,
}

/// Concurrency-safe store of per-stream failure statistics
pub struct StatsAggregator {
    entries: RwLock<HashMap<StreamKey, Arc<Mutex<FailureStats>>>>,
    spam_window: Duration,
    spam_threshold: usize,
}

impl StatsAggregator {
    /// Create an aggregator
    ///
    /// # Arguments
    ///
    /// * `spam_window` - Window in which occurrences count toward spam detection
    /// * `spam_threshold` - Occurrences inside the window that latch the spam flag
    pub fn new(spam_window: Duration, spam_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            spam_window,
            spam_threshold,
        }
    }

    /// Make a stream visible in summaries before its first occurrence
    pub fn register(&self, key: &StreamKey) {
        self.entry(key);
    }

    fn entry(&self, key: &StreamKey) -> Arc<Mutex<FailureStats>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(FailureStats::new(key.category)))),
        )
    }

    fn existing(&self, key: &StreamKey) -> Option<Arc<Mutex<FailureStats>>> {
        self.entries.read().get(key).map(Arc::clone)
    }

    /// Record one matched line for a stream
    ///
    /// Increments the total, appends to the rolling window (evicting the oldest
    /// entry at capacity), bumps the consecutive counter for overruns and
    /// latches spam detection once the recent-window count reaches the
    /// threshold.
    pub fn record_occurrence(
        &self,
        key: &StreamKey,
        line: &str,
        now: Timestamp,
    ) -> OccurrenceSnapshot {
        let entry = self.entry(key);
        let mut stats = entry.lock();

        stats.total_count += 1;
        stats.last_occurrence = Some(now);
        stats.push(Occurrence {
            timestamp: now,
            line: line.to_string(),
        });
        if key.category == FailureCategory::BufferOverrun {
            stats.consecutive_failures += 1;
        }

        let recent_count = stats.count_since(now - self.spam_window);
        let spam_newly_detected = !stats.spam_detected && recent_count >= self.spam_threshold;
        if spam_newly_detected {
            stats.spam_detected = true;
        }

        OccurrenceSnapshot {
            key: key.clone(),
            timestamp: now,
            line: line.to_string(),
            total_count: stats.total_count,
            consecutive_failures: stats.consecutive_failures,
            recent_count,
            spam_detected: stats.spam_detected,
            spam_newly_detected,
            restart_attempts: stats.restart_attempts,
        }
    }

    /// Record that a restart of the service's overrun stream was started
    pub fn record_restart_attempt(&self, service: &ServiceKey, now: Timestamp) {
        let key = StreamKey::new(
            service.node.clone(),
            service.service.clone(),
            FailureCategory::BufferOverrun,
        );
        let entry = self.entry(&key);
        let mut stats = entry.lock();
        stats.restart_attempts += 1;
        if stats.restart_history.len() >= RESTART_HISTORY_CAPACITY {
            stats.restart_history.pop_front();
        }
        stats.restart_history.push_back(now);
    }

    /// Clear the consecutive counter and spam latch after a successful restart
    pub fn reset_after_restart(&self, service: &ServiceKey) {
        for category in [FailureCategory::BufferOverrun, FailureCategory::Underrun] {
            let key = StreamKey::new(service.node.clone(), service.service.clone(), category);
            if let Some(entry) = self.existing(&key) {
                let mut stats = entry.lock();
                stats.consecutive_failures = 0;
                stats.spam_detected = false;
            }
        }
    }

    /// Forget the restart attempts of the service's overrun stream
    pub fn reset_restart_attempts(&self, service: &ServiceKey) {
        let key = StreamKey::new(
            service.node.clone(),
            service.service.clone(),
            FailureCategory::BufferOverrun,
        );
        if let Some(entry) = self.existing(&key) {
            let mut stats = entry.lock();
            stats.restart_attempts = 0;
            stats.restart_history.clear();
        }
    }

    /// Copy of one stream's statistics
    pub fn snapshot(&self, key: &StreamKey) -> Option<FailureStats> {
        self.existing(key).map(|entry| entry.lock().clone())
    }

    /// Build the summary of every stream of one category
    ///
    /// Read-only: each entry is copied under its own lock, so concurrent
    /// occurrences are either fully included or not at all.
    pub fn summary(
        &self,
        category: FailureCategory,
        now: Timestamp,
        horizon: Duration,
    ) -> CategorySummary {
        let entries: Vec<(StreamKey, Arc<Mutex<FailureStats>>)> = self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| key.category == category)
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let cutoff = now - horizon;
        let mut systems: BTreeMap<String, BTreeMap<String, ServiceSummary>> = BTreeMap::new();
        let mut total_count = 0;
        let mut recent_count = 0;

        for (key, entry) in entries {
            let stats = entry.lock().clone();
            let summary = ServiceSummary {
                total_count: stats.total_count,
                recent_count: stats.count_since(cutoff),
                last_occurrence: stats.last_occurrence,
                consecutive_failures: stats.consecutive_failures,
                restart_attempts: stats.restart_attempts,
                last_restart_attempt: stats.restart_history.back().copied(),
                spam_detected: stats.spam_detected,
            };
            total_count += summary.total_count;
            recent_count += summary.recent_count;
            systems
                .entry(key.node)
                .or_default()
                .insert(key.service, summary);
        }

        CategorySummary {
            category,
            generated_at: now,
            systems,
            total_count,
            recent_count,
        }
    }
}
