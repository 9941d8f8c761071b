//! Consumer loop state machine.

use crate::config::ConsumerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{PipelineError, PipelineResult, SourceResult, WriteError};
use crate::offset::{CommitOutcome, OffsetTracker};
use crate::shutdown::ShutdownSignal;
use crate::sink::SinkWriter;
use crate::source::LogSource;
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use logsink_model::{
    decode, Classify, DeadLetterRecord, DecodedEvent, FailureReason, LogRecord, PartitionId,
};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The current state of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not started, or the last fetch found no data.
    Idle,
    /// Waiting on the log for the next record.
    Fetching,
    /// Turning the record payload into an event.
    Decoding,
    /// Upserting the event into the store.
    Writing,
    /// Waiting before retrying a transient failure.
    Backoff,
    /// Routing a record to the dead-letter sink.
    DeadLetter,
    /// Advancing the partition cursor.
    Committing,
    /// Stopped gracefully.
    Stopped,
    /// Stopped by a fatal error.
    Failed,
}

impl LoopState {
    /// Returns true while a record is being worked on.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LoopState::Fetching
                | LoopState::Decoding
                | LoopState::Writing
                | LoopState::Backoff
                | LoopState::DeadLetter
                | LoopState::Committing
        )
    }

    /// Returns true once the loop has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed)
    }

    /// Lower-case name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Fetching => "fetching",
            LoopState::Decoding => "decoding",
            LoopState::Writing => "writing",
            LoopState::Backoff => "backoff",
            LoopState::DeadLetter => "dead-letter",
            LoopState::Committing => "committing",
            LoopState::Stopped => "stopped",
            LoopState::Failed => "failed",
        }
    }
}

/// Running counters of a consumer loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Records returned by the log.
    pub records_fetched: u64,
    /// Records written to the store.
    pub records_persisted: u64,
    /// Records routed to the dead-letter sink.
    pub records_dead_lettered: u64,
    /// Backoffs taken for transient store or dead-letter failures.
    pub write_retries: u64,
    /// Backoffs taken for transient log failures.
    pub fetch_retries: u64,
    /// Commits that moved the cursor.
    pub commits: u64,
    /// Offset the cursor points at, loaded or committed.
    pub last_committed_offset: Option<u64>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Why a loop stopped gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The shutdown signal was triggered.
    Shutdown,
    /// The log ran dry and the loop was asked to stop when idle.
    Idle,
}

/// Outcome of a graceful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Partition consumed.
    pub partition: PartitionId,
    /// Why the loop stopped.
    pub cause: StopCause,
    /// Final counters.
    pub stats: ConsumerStats,
    /// Offset the cursor points at.
    pub last_committed: Option<u64>,
    /// Time spent running.
    pub duration: Duration,
}

/// How the handling of one record ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Persisted,
    DeadLettered(FailureReason),
    Interrupted,
}

/// How the write phase of one record ended.
enum Written {
    Persisted,
    Failed { error: WriteError, attempts: u32 },
    Interrupted,
}

/// Moves one partition from the log into the store.
///
/// Each record goes through `FETCHING → DECODING → WRITING → COMMITTING`;
/// transient failures detour through `BACKOFF`, permanent ones through
/// `DEAD_LETTER`. The cursor is committed only after the record is durably
/// persisted or dead-lettered, and strictly in offset order.
pub struct ConsumerLoop<L, S, D, O>
where
    L: LogSource,
    S: DocumentStore,
    D: DeadLetterSink,
    O: OffsetTracker,
{
    config: ConsumerConfig,
    source: L,
    writer: SinkWriter<S>,
    dead_letters: D,
    offsets: O,
    shutdown: ShutdownSignal,
    state: RwLock<LoopState>,
    stats: RwLock<ConsumerStats>,
}

impl<L, S, D, O> ConsumerLoop<L, S, D, O>
where
    L: LogSource,
    S: DocumentStore,
    D: DeadLetterSink,
    O: OffsetTracker,
{
    /// Creates a loop from the handles it owns for its lifetime.
    pub fn new(
        config: ConsumerConfig,
        source: L,
        writer: SinkWriter<S>,
        dead_letters: D,
        offsets: O,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            source,
            writer,
            dead_letters,
            offsets,
            shutdown,
            state: RwLock::new(LoopState::Idle),
            stats: RwLock::new(ConsumerStats::default()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> ConsumerStats {
        self.stats.read().clone()
    }

    /// Partition this loop consumes.
    pub fn partition(&self) -> PartitionId {
        self.config.partition
    }

    /// The signal that stops this loop.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// The sink writer.
    pub fn writer(&self) -> &SinkWriter<S> {
        &self.writer
    }

    fn set_state(&self, state: LoopState) {
        *self.state.write() = state;
    }

    /// Runs until shutdown, idleness (if configured) or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] for failures that make committing unsafe:
    /// cursor failures, an unreachable log, an unusable dead-letter sink or
    /// a store that keeps failing.
    pub fn run(&self) -> PipelineResult<RunSummary> {
        let started = Instant::now();
        let partition = self.config.partition;

        let result = self.config.validate().and_then(|()| self.run_inner());
        match result {
            Ok(cause) => {
                self.set_state(LoopState::Stopped);
                let stats = self.stats();
                info!(
                    partition = partition.get(),
                    cause = ?cause,
                    persisted = stats.records_persisted,
                    dead_lettered = stats.records_dead_lettered,
                    "consumer stopped"
                );
                Ok(RunSummary {
                    partition,
                    cause,
                    last_committed: stats.last_committed_offset,
                    stats,
                    duration: started.elapsed(),
                })
            }
            Err(err) => {
                self.set_state(LoopState::Failed);
                self.stats.write().last_error = Some(err.to_string());
                error!(partition = partition.get(), error = %err, "consumer failed");
                Err(err)
            }
        }
    }

    fn run_inner(&self) -> PipelineResult<StopCause> {
        let partition = self.config.partition;

        let cursor = self
            .offsets
            .load(partition)
            .map_err(|source| PipelineError::CursorLoad { partition, source })?;
        let mut next = match cursor {
            Some(cursor) => {
                self.stats.write().last_committed_offset = Some(cursor.last_safe_offset);
                cursor.resume_offset()
            }
            None => match self.with_reconnect(|| self.source.earliest_offset(partition))? {
                Some(earliest) => earliest,
                None => return Ok(StopCause::Shutdown),
            },
        };
        info!(partition = partition.get(), offset = next, "consumer starting");

        let mut streak: u32 = 0;
        loop {
            if self.shutdown.is_triggered() {
                return Ok(StopCause::Shutdown);
            }

            let fetched = self.with_reconnect(|| {
                self.set_state(LoopState::Fetching);
                self.source
                    .fetch(partition, next, self.config.fetch_timeout)
            })?;
            let record = match fetched {
                None => return Ok(StopCause::Shutdown),
                Some(None) => {
                    self.set_state(LoopState::Idle);
                    if self.config.stop_when_idle {
                        return Ok(StopCause::Idle);
                    }
                    continue;
                }
                Some(Some(record)) => record,
            };

            if record.offset < next {
                debug!(
                    partition = partition.get(),
                    offset = record.offset,
                    expected = next,
                    "ignoring record below resume offset"
                );
                continue;
            }
            if record.offset > next {
                info!(
                    partition = partition.get(),
                    offset = record.offset,
                    expected = next,
                    "offset gap in log"
                );
            }
            self.stats.write().records_fetched += 1;

            let offset = record.offset;
            match self.handle(&record)? {
                Handled::Interrupted => return Ok(StopCause::Shutdown),
                Handled::Persisted => streak = 0,
                Handled::DeadLettered(reason) if reason.is_store_side() => streak += 1,
                Handled::DeadLettered(FailureReason::StoreRejected) => streak = 0,
                Handled::DeadLettered(_) => {}
            }

            self.commit(offset)?;
            next = offset.saturating_add(1);

            let threshold = self.config.systemic_failure_threshold;
            if threshold > 0 && streak >= threshold {
                return Err(PipelineError::StoreUnavailable {
                    partition,
                    consecutive: streak,
                });
            }
        }
    }

    fn handle(&self, record: &LogRecord) -> PipelineResult<Handled> {
        let first_seen = Utc::now();

        self.set_state(LoopState::Decoding);
        let event = match decode(&record.value) {
            Ok(event) => event,
            Err(err) => {
                return self.dead_letter(record, err.reason(), err.to_string(), first_seen, 1);
            }
        };

        match self.write(&event, record) {
            Written::Persisted => {
                self.stats.write().records_persisted += 1;
                Ok(Handled::Persisted)
            }
            Written::Failed { error, attempts } => {
                self.dead_letter(record, error.reason(), error.to_string(), first_seen, attempts)
            }
            Written::Interrupted => Ok(Handled::Interrupted),
        }
    }

    fn write(&self, event: &DecodedEvent, record: &LogRecord) -> Written {
        let max_attempts = self.config.retry.max_attempts;
        let mut attempt = 1;
        loop {
            self.set_state(LoopState::Writing);
            match self.writer.persist(event, record.position()) {
                Ok(ack) => {
                    debug!(
                        partition = record.partition.get(),
                        offset = record.offset,
                        key = %ack.key,
                        outcome = ?ack.outcome,
                        "record persisted"
                    );
                    return Written::Persisted;
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    self.stats.write().write_retries += 1;
                    if self.backoff(record, attempt, &err.to_string()) {
                        return Written::Interrupted;
                    }
                    attempt += 1;
                }
                Err(error) => {
                    return Written::Failed {
                        error,
                        attempts: attempt,
                    }
                }
            }
        }
    }

    fn dead_letter(
        &self,
        record: &LogRecord,
        reason: FailureReason,
        detail: String,
        first_seen: DateTime<Utc>,
        attempts: u32,
    ) -> PipelineResult<Handled> {
        let letter = DeadLetterRecord::new(record.clone(), reason, detail, first_seen, attempts);
        let max_attempts = self.config.retry.max_attempts;
        let mut attempt = 1;
        loop {
            self.set_state(LoopState::DeadLetter);
            match self.dead_letters.append(&letter) {
                Ok(()) => {
                    self.stats.write().records_dead_lettered += 1;
                    warn!(
                        partition = record.partition.get(),
                        offset = record.offset,
                        reason = reason.as_str(),
                        attempts,
                        detail = %letter.detail,
                        "record dead-lettered"
                    );
                    return Ok(Handled::DeadLettered(reason));
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    self.stats.write().write_retries += 1;
                    if self.backoff(record, attempt, &err.to_string()) {
                        return Ok(Handled::Interrupted);
                    }
                    attempt += 1;
                }
                Err(source) => {
                    return Err(PipelineError::DeadLetter {
                        partition: record.partition,
                        offset: record.offset,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Sleeps before retry number `attempt` of `record`.
    ///
    /// Returns true if shutdown cut the sleep short.
    fn backoff(&self, record: &LogRecord, attempt: u32, error: &str) -> bool {
        let delay = self.config.retry.delay_for_attempt(attempt);
        warn!(
            partition = record.partition.get(),
            offset = record.offset,
            attempt,
            delay_ms = millis(delay),
            error,
            "transient failure, backing off"
        );
        self.set_state(LoopState::Backoff);
        self.shutdown.sleep(delay)
    }

    fn commit(&self, offset: u64) -> PipelineResult<()> {
        let partition = self.config.partition;
        self.set_state(LoopState::Committing);
        match self.offsets.commit(partition, offset) {
            Ok(CommitOutcome::Advanced) => {
                let mut stats = self.stats.write();
                stats.commits += 1;
                stats.last_committed_offset = Some(offset);
                Ok(())
            }
            Ok(outcome) => {
                warn!(
                    partition = partition.get(),
                    offset,
                    outcome = ?outcome,
                    "commit did not move the cursor"
                );
                Ok(())
            }
            Err(source) => Err(PipelineError::Commit {
                partition,
                offset,
                source,
            }),
        }
    }

    /// Runs `op` against the log, reconnecting on transient errors.
    ///
    /// Returns `Ok(None)` if shutdown was requested while waiting.
    fn with_reconnect<T>(&self, mut op: impl FnMut() -> SourceResult<T>) -> PipelineResult<Option<T>> {
        let partition = self.config.partition;
        let policy = &self.config.reconnect;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(Some(value)),
                Err(source) if source.is_transient() => {
                    if attempt >= policy.max_attempts {
                        return Err(PipelineError::SourceUnavailable {
                            partition,
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        partition = partition.get(),
                        attempt,
                        delay_ms = millis(delay),
                        error = %source,
                        "log unavailable, reconnecting"
                    );
                    self.stats.write().fetch_retries += 1;
                    self.set_state(LoopState::Backoff);
                    if self.shutdown.sleep(delay) {
                        return Ok(None);
                    }
                    attempt += 1;
                }
                Err(source) => return Err(PipelineError::Source { partition, source }),
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SinkConfig};
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::error::{OffsetCommitError, SourceError, StoreError};
    use crate::offset::MemoryOffsetTracker;
    use crate::source::MemoryLog;
    use crate::store::MemoryDocumentStore;
    use std::sync::Arc;

    const P0: PartitionId = PartitionId(0);

    type TestLoop = ConsumerLoop<
        Arc<MemoryLog>,
        Arc<MemoryDocumentStore>,
        Arc<MemoryDeadLetterSink>,
        Arc<MemoryOffsetTracker>,
    >;

    struct Harness {
        log: Arc<MemoryLog>,
        store: Arc<MemoryDocumentStore>,
        dead_letters: Arc<MemoryDeadLetterSink>,
        offsets: Arc<MemoryOffsetTracker>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(MemoryLog::new()),
                store: Arc::new(MemoryDocumentStore::new()),
                dead_letters: Arc::new(MemoryDeadLetterSink::new()),
                offsets: Arc::new(MemoryOffsetTracker::new()),
            }
        }

        fn consumer(&self, config: ConsumerConfig) -> TestLoop {
            ConsumerLoop::new(
                config,
                Arc::clone(&self.log),
                SinkWriter::new(Arc::clone(&self.store), SinkConfig::default()),
                Arc::clone(&self.dead_letters),
                Arc::clone(&self.offsets),
                ShutdownSignal::new(),
            )
        }

        fn push(&self, json: &str) -> u64 {
            self.log.append(P0, json.as_bytes().to_vec())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_jitter(false)
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::new(P0)
            .with_fetch_timeout(Duration::from_millis(10))
            .with_retry(fast_retry(3))
            .with_reconnect(fast_retry(3))
            .with_stop_when_idle(true)
    }

    fn event(id: i64) -> String {
        format!(r#"{{"id":{id},"name":"alpha","timestamp":"2024-01-01T00:00:00Z"}}"#)
    }

    #[test]
    fn state_predicates() {
        assert!(LoopState::Backoff.is_active());
        assert!(!LoopState::Idle.is_active());
        assert!(LoopState::Failed.is_terminal());
        assert!(!LoopState::Committing.is_terminal());
        assert_eq!(LoopState::DeadLetter.as_str(), "dead-letter");
    }

    #[test]
    fn drains_log_and_stops_when_idle() {
        let h = Harness::new();
        h.push(&event(1));
        h.push(&event(2));

        let consumer = h.consumer(config());
        let summary = consumer.run().unwrap();
        assert_eq!(summary.cause, StopCause::Idle);
        assert_eq!(summary.last_committed, Some(1));
        assert_eq!(summary.stats.records_persisted, 2);
        assert_eq!(summary.stats.commits, 2);
        assert_eq!(consumer.state(), LoopState::Stopped);
        assert_eq!(h.store.count("messages").unwrap(), 2);
    }

    #[test]
    fn empty_log_without_cursor_starts_at_earliest() {
        let h = Harness::new();
        for id in 0..4 {
            h.push(&event(id));
        }
        h.log.truncate_before(P0, 2);

        let summary = h.consumer(config()).run().unwrap();
        assert_eq!(summary.stats.records_fetched, 2);
        let offsets: Vec<u64> = h.offsets.history().iter().map(|c| c.last_safe_offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[test]
    fn transient_write_failure_is_retried_on_same_record() {
        let h = Harness::new();
        h.push(&event(1));
        h.store.fail_next([StoreError::Timeout("slow".into())]);

        let summary = h.consumer(config()).run().unwrap();
        assert_eq!(summary.stats.write_retries, 1);
        assert_eq!(summary.stats.records_persisted, 1);
        assert!(h.dead_letters.is_empty());
        assert_eq!(h.store.upsert_calls(), 2);
    }

    #[test]
    fn retry_budget_counts_total_attempts() {
        let h = Harness::new();
        h.push(&event(1));
        h.store.fail_next((0..3).map(|_| StoreError::Unavailable("down".into())));

        let consumer = h.consumer(config().with_systemic_failure_threshold(0));
        let summary = consumer.run().unwrap();
        assert_eq!(h.store.upsert_calls(), 3);
        assert_eq!(summary.stats.write_retries, 2);

        let letters = h.dead_letters.records();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, FailureReason::RetriesExhausted);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(summary.last_committed, Some(0));
    }

    #[test]
    fn decode_failure_is_dead_lettered_without_store_call() {
        let h = Harness::new();
        h.push("not json");

        let summary = h.consumer(config()).run().unwrap();
        assert_eq!(summary.stats.records_dead_lettered, 1);
        assert_eq!(h.store.upsert_calls(), 0);
        assert_eq!(
            h.dead_letters.records()[0].reason,
            FailureReason::MalformedPayload
        );
    }

    #[test]
    fn commit_failure_is_fatal() {
        let h = Harness::new();
        h.push(&event(1));
        h.offsets
            .fail_next_commits([OffsetCommitError::Unavailable("disk gone".into())]);

        let consumer = h.consumer(config());
        let err = consumer.run().unwrap_err();
        assert!(matches!(err, PipelineError::Commit { offset: 0, .. }));
        assert_eq!(consumer.state(), LoopState::Failed);
        assert!(consumer.stats().last_error.is_some());
    }

    #[test]
    fn permanent_log_error_is_fatal() {
        let h = Harness::new();
        h.log
            .fail_next_fetches([SourceError::Unauthorized("bad credentials".into())]);

        let err = h.consumer(config()).run().unwrap_err();
        assert!(matches!(err, PipelineError::Source { .. }));
    }

    #[test]
    fn transient_log_error_reconnects() {
        let h = Harness::new();
        h.push(&event(1));
        h.log.fail_next_fetches([SourceError::Timeout]);

        let summary = h.consumer(config()).run().unwrap();
        assert_eq!(summary.stats.fetch_retries, 1);
        assert_eq!(summary.stats.records_persisted, 1);
    }

    #[test]
    fn invalid_config_fails_before_reading() {
        let h = Harness::new();
        let consumer = h.consumer(config().with_retry(RetryConfig::new(0)));
        assert!(matches!(consumer.run(), Err(PipelineError::Config(_))));
        assert_eq!(h.log.fetch_count(), 0);
    }

    #[test]
    fn triggered_shutdown_stops_before_fetching() {
        let h = Harness::new();
        h.push(&event(1));
        let consumer = h.consumer(config());
        consumer.shutdown_signal().trigger();

        let summary = consumer.run().unwrap();
        assert_eq!(summary.cause, StopCause::Shutdown);
        assert_eq!(h.log.fetch_count(), 0);
        assert!(h.offsets.history().is_empty());
    }
}
