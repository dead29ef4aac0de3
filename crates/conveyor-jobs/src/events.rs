//! Event log and snapshots.
//!
//! Every job lifecycle change is appended here with a gap-free sequence
//! number. Every `snapshot_frequency` appends, the entries since the previous
//! snapshot are folded into aggregate counters and a new snapshot is written.
//! Entries at or below the latest snapshot watermark may then be archived,
//! and only the newest snapshots are kept.

use crate::job::JobId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Snapshots kept by a log built with [`EventLog::new`].
pub const DEFAULT_RETAINED_SNAPSHOTS: usize = 8;

/// Job lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enqueued,
    Started,
    Retried,
    Completed,
    Failed,
    DeadLettered,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Enqueued => "enqueued",
            EventType::Started => "started",
            EventType::Retried => "retried",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context recorded with an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub queue: String,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl EventMetadata {
    pub fn new(queue: impl Into<String>, attempt: u32) -> Self {
        Self {
            queue: queue.into(),
            attempt,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Starts at 1 and increases by exactly 1 per append.
    pub sequence: u64,
    pub job_id: JobId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: EventMetadata,
}

/// State derived by folding events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounters {
    pub total_events: u64,
    pub last_sequence: u64,
    pub by_type: BTreeMap<EventType, u64>,
    pub by_queue: BTreeMap<String, BTreeMap<EventType, u64>>,
}

impl AggregateCounters {
    pub fn apply(&mut self, entry: &EventLogEntry) {
        self.total_events += 1;
        self.last_sequence = entry.sequence;
        *self.by_type.entry(entry.event_type).or_default() += 1;
        *self
            .by_queue
            .entry(entry.metadata.queue.clone())
            .or_default()
            .entry(entry.event_type)
            .or_default() += 1;
    }

    pub fn count(&self, event_type: EventType) -> u64 {
        self.by_type.get(&event_type).copied().unwrap_or(0)
    }
}

/// Compacted checkpoint of the aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last sequence folded into `counters`.
    pub sequence_watermark: u64,
    pub counters: AggregateCounters,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventLogError {
    /// Entries up to this sequence were archived; a full replay is no longer possible.
    #[error("event log archived through sequence {0}")]
    Archived(u64),
}

#[derive(Debug, Default)]
struct LogInner {
    next_sequence: u64,
    entries: Vec<EventLogEntry>,
    snapshots: Vec<Snapshot>,
    since_snapshot: u64,
    archived_through: u64,
}

impl LogInner {
    fn latest_watermark(&self) -> u64 {
        self.snapshots.last().map_or(0, |s| s.sequence_watermark)
    }

    /// Counters of the latest snapshot plus every retained entry after it.
    fn fold_tail(&self) -> AggregateCounters {
        let mut counters = self
            .snapshots
            .last()
            .map(|s| s.counters.clone())
            .unwrap_or_default();
        let watermark = self.latest_watermark();
        for entry in self.entries.iter().filter(|e| e.sequence > watermark) {
            counters.apply(entry);
        }
        counters
    }

    /// Removes entries covered by the latest snapshot.
    fn archive(&mut self) -> Vec<EventLogEntry> {
        let watermark = self.latest_watermark();
        let split = self.entries.partition_point(|e| e.sequence <= watermark);
        let archived: Vec<EventLogEntry> = self.entries.drain(..split).collect();
        if let Some(last) = archived.last() {
            self.archived_through = last.sequence;
            debug!(count = archived.len(), through = last.sequence, "Archived event log entries");
        }
        archived
    }

    fn compact(&mut self, retained_snapshots: usize) -> Option<Snapshot> {
        let watermark = self.latest_watermark();
        let head = self.next_sequence.saturating_sub(1);
        if head <= watermark {
            return None;
        }

        let snapshot = Snapshot {
            sequence_watermark: head,
            counters: self.fold_tail(),
            created_at: Utc::now(),
        };
        self.snapshots.push(snapshot.clone());
        let excess = self.snapshots.len().saturating_sub(retained_snapshots.max(1));
        self.snapshots.drain(..excess);
        self.since_snapshot = 0;
        debug!(watermark = head, snapshots = self.snapshots.len(), "Event log compacted");
        Some(snapshot)
    }
}

/// Append-only job event log.
///
/// Appends are serialized by one lock, which keeps sequences gap-free.
pub struct EventLog {
    enabled: bool,
    snapshot_frequency: u64,
    retained_snapshots: usize,
    archive_on_compact: bool,
    inner: Mutex<LogInner>,
}

impl EventLog {
    pub fn new(snapshot_frequency: u64) -> Self {
        Self {
            enabled: true,
            snapshot_frequency: snapshot_frequency.max(1),
            retained_snapshots: DEFAULT_RETAINED_SNAPSHOTS,
            archive_on_compact: false,
            inner: Mutex::new(LogInner {
                next_sequence: 1,
                ..LogInner::default()
            }),
        }
    }

    /// A log that discards every append.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(1)
        }
    }

    /// Keeps at most `count` snapshots (at least one).
    pub fn with_retained_snapshots(mut self, count: usize) -> Self {
        self.retained_snapshots = count.max(1);
        self
    }

    /// Drops covered entries every time a snapshot is written.
    ///
    /// After the first such compaction `replay_full` reports `Archived`.
    pub fn with_archive_on_compact(mut self, archive: bool) -> Self {
        self.archive_on_compact = archive;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Appends an event and returns its sequence, or `None` when disabled.
    ///
    /// Compacts in the same critical section when the snapshot frequency is reached.
    pub fn append(&self, job_id: &JobId, event_type: EventType, metadata: EventMetadata) -> Option<u64> {
        if !self.enabled {
            return None;
        }

        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.push(EventLogEntry {
            sequence,
            job_id: job_id.clone(),
            event_type,
            timestamp: Utc::now(),
            metadata,
        });
        inner.since_snapshot += 1;

        if inner.since_snapshot >= self.snapshot_frequency {
            self.compact_locked(&mut inner);
        }

        Some(sequence)
    }

    /// Folds everything since the last snapshot into a new snapshot.
    ///
    /// Returns `None` when no event was appended since the last snapshot.
    pub fn compact(&self) -> Option<Snapshot> {
        self.compact_locked(&mut self.inner.lock())
    }

    fn compact_locked(&self, inner: &mut LogInner) -> Option<Snapshot> {
        let snapshot = inner.compact(self.retained_snapshots)?;
        if self.archive_on_compact {
            inner.archive();
        }
        Some(snapshot)
    }

    /// Aggregate state from the latest snapshot plus the log tail.
    pub fn reconstruct(&self) -> AggregateCounters {
        self.inner.lock().fold_tail()
    }

    /// Aggregate state from replaying every entry from sequence 1.
    pub fn replay_full(&self) -> Result<AggregateCounters, EventLogError> {
        let inner = self.inner.lock();
        if inner.archived_through > 0 {
            return Err(EventLogError::Archived(inner.archived_through));
        }
        let mut counters = AggregateCounters::default();
        for entry in &inner.entries {
            counters.apply(entry);
        }
        Ok(counters)
    }

    /// Removes and returns entries covered by the latest snapshot.
    pub fn archive_compacted(&self) -> Vec<EventLogEntry> {
        self.inner.lock().archive()
    }

    /// Retained entries in sequence order.
    pub fn entries(&self) -> Vec<EventLogEntry> {
        self.inner.lock().entries.clone()
    }

    /// Retained entries of one job, in the order they happened.
    pub fn entries_for(&self, job_id: &JobId) -> Vec<EventLogEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.inner.lock().snapshots.clone()
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.inner.lock().snapshots.last().cloned()
    }

    /// Sequence of the most recent append, 0 before the first.
    pub fn head(&self) -> u64 {
        self.inner.lock().next_sequence - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_n(log: &EventLog, n: usize) -> Vec<JobId> {
        let types = [EventType::Enqueued, EventType::Started, EventType::Completed];
        (0..n)
            .map(|i| {
                let id = JobId::new();
                let queue = if i % 2 == 0 { "email" } else { "analytics" };
                log.append(&id, types[i % types.len()], EventMetadata::new(queue, 0));
                id
            })
            .collect()
    }

    #[test]
    fn test_sequences_start_at_one_without_gaps() {
        let log = EventLog::new(100);
        append_n(&log, 5);
        let sequences: Vec<u64> = log.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.head(), 5);
    }

    #[test]
    fn test_snapshot_every_n_appends() {
        let log = EventLog::new(10);
        append_n(&log, 25);
        let watermarks: Vec<u64> = log.snapshots().iter().map(|s| s.sequence_watermark).collect();
        assert_eq!(watermarks, vec![10, 20]);
    }

    #[test]
    fn test_reconstruct_matches_full_replay_for_any_frequency() {
        for frequency in [1, 2, 3, 7, 10, 50] {
            let log = EventLog::new(frequency);
            append_n(&log, 23);
            assert_eq!(log.reconstruct(), log.replay_full().unwrap(), "frequency {}", frequency);
        }
    }

    #[test]
    fn test_manual_compact() {
        let log = EventLog::new(100);
        assert!(log.compact().is_none());
        append_n(&log, 3);
        let snapshot = log.compact().unwrap();
        assert_eq!(snapshot.sequence_watermark, 3);
        assert_eq!(snapshot.counters.total_events, 3);
        assert!(log.compact().is_none());
    }

    #[test]
    fn test_archive_compacted() {
        let log = EventLog::new(10);
        append_n(&log, 14);
        let before = log.reconstruct();

        let archived = log.archive_compacted();
        assert_eq!(archived.len(), 10);
        assert_eq!(archived.last().unwrap().sequence, 10);
        assert_eq!(log.entries().len(), 4);
        assert_eq!(log.reconstruct(), before);
        assert_eq!(log.replay_full(), Err(EventLogError::Archived(10)));
    }

    #[test]
    fn test_old_snapshots_dropped() {
        let log = EventLog::new(5).with_retained_snapshots(2);
        append_n(&log, 23);
        let watermarks: Vec<u64> = log.snapshots().iter().map(|s| s.sequence_watermark).collect();
        assert_eq!(watermarks, vec![15, 20]);
        assert_eq!(log.latest_snapshot().unwrap().sequence_watermark, 20);
        assert_eq!(log.reconstruct(), log.replay_full().unwrap());
    }

    #[test]
    fn test_archive_on_compact_bounds_entries() {
        let log = EventLog::new(10).with_archive_on_compact(true);
        let reference = EventLog::new(10);
        append_n(&log, 34);
        append_n(&reference, 34);

        assert_eq!(log.entries().len(), 4);
        assert_eq!(log.entries()[0].sequence, 31);
        assert_eq!(log.head(), 34);
        assert_eq!(log.replay_full(), Err(EventLogError::Archived(30)));
        assert_eq!(log.reconstruct().total_events, 34);
        assert_eq!(log.reconstruct().by_type, reference.replay_full().unwrap().by_type);
    }

    #[test]
    fn test_counters_by_queue() {
        let log = EventLog::new(100);
        let id = JobId::new();
        log.append(&id, EventType::Enqueued, EventMetadata::new("email", 0));
        log.append(&id, EventType::Started, EventMetadata::new("email", 0));
        log.append(&id, EventType::Retried, EventMetadata::new("email", 1).with_reason("circuit-open"));

        let counters = log.reconstruct();
        assert_eq!(counters.count(EventType::Retried), 1);
        assert_eq!(counters.by_queue["email"][&EventType::Started], 1);
        assert_eq!(log.entries_for(&id).len(), 3);
    }

    #[test]
    fn test_disabled_log_ignores_appends() {
        let log = EventLog::disabled();
        assert_eq!(log.append(&JobId::new(), EventType::Enqueued, EventMetadata::default()), None);
        assert!(log.entries().is_empty());
    }
}
