//! End-to-end tests of the consumer loop over in-memory components.

use logsink_engine::{
    ConsumerConfig, ConsumerLoop, DeadLetterError, DocumentStore, LogSource, MemoryDeadLetterSink,
    MemoryDocumentStore, MemoryLog, MemoryOffsetTracker, PipelineError, RetryConfig,
    ShutdownSignal, SinkConfig, SinkWriter, SourceError, StopCause, StoreError,
};
use logsink_model::{DocumentKey, FailureReason, KeyStrategy, PartitionId};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const P0: PartitionId = PartitionId(0);
const P1: PartitionId = PartitionId(1);

type TestLoop = ConsumerLoop<
    Arc<MemoryLog>,
    Arc<MemoryDocumentStore>,
    Arc<MemoryDeadLetterSink>,
    Arc<MemoryOffsetTracker>,
>;

/// Shared components of one pipeline.
struct Pipeline {
    log: Arc<MemoryLog>,
    store: Arc<MemoryDocumentStore>,
    dead_letters: Arc<MemoryDeadLetterSink>,
    offsets: Arc<MemoryOffsetTracker>,
}

impl Pipeline {
    fn new() -> Self {
        Self::with_offsets(MemoryOffsetTracker::new())
    }

    fn with_offsets(offsets: MemoryOffsetTracker) -> Self {
        Self {
            log: Arc::new(MemoryLog::new()),
            store: Arc::new(MemoryDocumentStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
            offsets: Arc::new(offsets),
        }
    }

    fn consumer(&self, config: ConsumerConfig) -> TestLoop {
        self.consumer_with_sink(config, SinkConfig::default())
    }

    fn consumer_with_sink(&self, config: ConsumerConfig, sink: SinkConfig) -> TestLoop {
        ConsumerLoop::new(
            config,
            Arc::clone(&self.log),
            SinkWriter::new(Arc::clone(&self.store), sink),
            Arc::clone(&self.dead_letters),
            Arc::clone(&self.offsets),
            ShutdownSignal::new(),
        )
    }

    fn push(&self, partition: PartitionId, payload: &str) -> u64 {
        self.log.append(partition, payload.as_bytes().to_vec())
    }

    fn committed(&self, partition: PartitionId) -> Vec<u64> {
        self.offsets
            .history()
            .iter()
            .filter(|c| c.partition == partition)
            .map(|c| c.last_safe_offset)
            .collect()
    }

    fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .store
            .documents("messages")
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        ids.sort();
        ids
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::new(max_attempts)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(4))
        .with_jitter(false)
}

fn config(partition: PartitionId) -> ConsumerConfig {
    ConsumerConfig::new(partition)
        .with_fetch_timeout(Duration::from_millis(10))
        .with_retry(fast_retry(3))
        .with_reconnect(fast_retry(3))
        .with_stop_when_idle(true)
}

fn event(id: i64, name: &str) -> String {
    format!(r#"{{"id":{id},"name":"{name}","timestamp":"2024-01-01T00:00:00Z"}}"#)
}

#[test]
fn test_mixed_batch_persists_valid_and_dead_letters_malformed() {
    let pipeline = Pipeline::new();
    pipeline.push(
        P0,
        r#"{"id":1,"name":"alpha","timestamp":"2024-01-01T00:00:00Z"}"#,
    );
    pipeline.push(P0, r#"{"id":2,"name":"beta"}"#);
    pipeline.push(
        P0,
        r#"{"id":3,"name":"gamma","timestamp":"2024-01-01T00:01:00Z"}"#,
    );

    let summary = pipeline.consumer(config(P0)).run().unwrap();

    assert_eq!(summary.cause, StopCause::Idle);
    assert_eq!(summary.last_committed, Some(2));
    assert_eq!(pipeline.ids(), vec![1, 3]);

    let letters = pipeline.dead_letters.records();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].record.offset, 1);
    assert_eq!(letters[0].reason, FailureReason::MalformedPayload);
    assert!(letters[0].detail.contains("timestamp"));

    assert_eq!(pipeline.committed(P0), vec![0, 1, 2]);
}

#[test]
fn test_redelivery_converges_on_same_documents() {
    let pipeline = Pipeline::new();
    for (id, name) in [(1, "alpha"), (2, "beta"), (1, "delta")] {
        pipeline.push(P0, &event(id, name));
    }

    pipeline.consumer(config(P0)).run().unwrap();
    let first = pipeline.store.documents("messages").unwrap();

    // Lose the cursor and replay everything.
    pipeline.offsets.reset(P0, None);
    pipeline.consumer(config(P0)).run().unwrap();
    let second = pipeline.store.documents("messages").unwrap();

    assert_eq!(first, second);
    assert_eq!(pipeline.ids(), vec![1, 2]);
    let latest = pipeline
        .store
        .get("messages", &DocumentKey::new("event-1"))
        .unwrap()
        .unwrap();
    assert_eq!(latest.name, "delta");
}

#[test]
fn test_resume_after_committed_offset() {
    let pipeline = Pipeline::with_offsets(MemoryOffsetTracker::new().with_cursor(P0, 4));
    for id in 1..=8 {
        pipeline.push(P0, &event(id, "alpha"));
    }

    let summary = pipeline.consumer(config(P0)).run().unwrap();

    assert_eq!(summary.stats.records_fetched, 3);
    assert_eq!(pipeline.ids(), vec![6, 7, 8]);
    assert_eq!(pipeline.committed(P0), vec![5, 6, 7]);
}

#[test]
fn test_transient_failure_below_bound_is_persisted() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline.store.fail_next([
        StoreError::from_code(91, "shutdown in progress"),
        StoreError::Timeout("socket".into()),
    ]);

    let summary = pipeline.consumer(config(P0)).run().unwrap();

    assert_eq!(summary.stats.records_persisted, 1);
    assert_eq!(summary.stats.write_retries, 2);
    assert!(pipeline.dead_letters.is_empty());
    assert_eq!(pipeline.committed(P0), vec![0]);
}

#[test]
fn test_transient_failure_beyond_bound_is_dead_lettered() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline.push(P0, &event(2, "beta"));
    pipeline
        .store
        .fail_next((0..3).map(|_| StoreError::Unavailable("primary stepped down".into())));

    let summary = pipeline.consumer(config(P0)).run().unwrap();

    let letters = pipeline.dead_letters.records();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].record.offset, 0);
    assert_eq!(letters[0].reason, FailureReason::RetriesExhausted);
    assert_eq!(letters[0].attempts, 3);

    assert_eq!(pipeline.ids(), vec![2]);
    assert_eq!(summary.last_committed, Some(1));
}

#[test]
fn test_permanent_rejection_skips_retries() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline.push(P0, &event(2, "beta"));
    pipeline.store.fail_next([
        StoreError::from_code(121, "Document failed validation"),
        StoreError::from_code(13, "not authorized on etl_db"),
    ]);

    let summary = pipeline.consumer(config(P0)).run().unwrap();

    assert_eq!(summary.stats.write_retries, 0);
    assert_eq!(pipeline.store.upsert_calls(), 2);
    let reasons: Vec<FailureReason> = pipeline
        .dead_letters
        .records()
        .iter()
        .map(|r| r.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![FailureReason::StoreRejected, FailureReason::Unauthorized]
    );
    assert_eq!(pipeline.committed(P0), vec![0, 1]);
}

#[test]
fn test_commit_failure_stops_worker() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline.push(P0, &event(2, "beta"));
    pipeline.offsets.fail_next_commits([logsink_engine::OffsetCommitError::Unavailable(
        "read-only filesystem".into(),
    )]);

    let consumer = pipeline.consumer(config(P0));
    let err = consumer.run().unwrap_err();

    assert!(matches!(err, PipelineError::Commit { offset: 0, .. }));
    assert_eq!(err.partition(), Some(P0));
    assert!(consumer.state().is_terminal());
    // The second record is never fetched.
    assert_eq!(consumer.stats().records_fetched, 1);
}

#[test]
fn test_shutdown_during_backoff_leaves_record_uncommitted() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline
        .store
        .fail_next([StoreError::Unavailable("no primary".into())]);

    let slow = RetryConfig::new(5)
        .with_initial_delay(Duration::from_secs(30))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter(false);
    let consumer = pipeline.consumer(config(P0).with_retry(slow));
    let signal = consumer.shutdown_signal().clone();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        signal.trigger();
    });

    let started = Instant::now();
    let summary = consumer.run().unwrap();
    trigger.join().unwrap();

    assert_eq!(summary.cause, StopCause::Shutdown);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(pipeline.committed(P0).is_empty());
    assert!(pipeline.dead_letters.is_empty());
    assert_eq!(pipeline.store.count("messages").unwrap(), 0);
}

#[test]
fn test_systemic_store_failure_is_fatal() {
    let pipeline = Pipeline::new();
    for id in 1..=5 {
        pipeline.push(P0, &event(id, "alpha"));
    }
    pipeline
        .store
        .fail_next((0..20).map(|_| StoreError::Unavailable("cluster down".into())));

    let consumer = pipeline.consumer(config(P0).with_retry(fast_retry(2)));
    let err = consumer.run().unwrap_err();

    assert!(matches!(
        err,
        PipelineError::StoreUnavailable { consecutive: 3, .. }
    ));
    // The failing records were dead-lettered and committed before stopping.
    assert_eq!(pipeline.dead_letters.len(), 3);
    assert_eq!(pipeline.committed(P0), vec![0, 1, 2]);
}

#[test]
fn test_failure_streak_counts_consecutive_store_failures() {
    let pipeline = Pipeline::new();
    for id in 1..=4 {
        pipeline.push(P0, &event(id, "alpha"));
    }
    pipeline
        .store
        .fail_next((0..4).map(|_| StoreError::Unavailable("flapping".into())));

    let consumer = pipeline
        .consumer(config(P0).with_retry(fast_retry(2)).with_systemic_failure_threshold(2));
    let err = consumer.run().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::StoreUnavailable { consecutive: 2, .. }
    ));
    assert_eq!(pipeline.committed(P0), vec![0, 1]);

    // A rejection proves the store answered, so it breaks the streak.
    let pipeline = Pipeline::new();
    for id in 1..=4 {
        pipeline.push(P0, &event(id, "alpha"));
    }
    pipeline.store.fail_next([
        StoreError::Unavailable("flapping".into()),
        StoreError::Unavailable("flapping".into()),
        StoreError::from_code(11000, "duplicate key"),
        StoreError::Unavailable("flapping".into()),
        StoreError::Unavailable("flapping".into()),
    ]);
    let consumer = pipeline
        .consumer(config(P0).with_retry(fast_retry(2)).with_systemic_failure_threshold(2));
    let summary = consumer.run().unwrap();
    assert_eq!(summary.stats.records_dead_lettered, 3);
    assert_eq!(summary.stats.records_persisted, 1);
}

#[test]
fn test_reconnect_budget_exhaustion_is_fatal() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline
        .log
        .fail_next_fetches((0..3).map(|_| SourceError::Unavailable("broker down".into())));

    let consumer = pipeline.consumer(config(P0).with_reconnect(fast_retry(3)));
    let err = consumer.run().unwrap_err();

    assert!(matches!(
        err,
        PipelineError::SourceUnavailable { attempts: 3, .. }
    ));
    assert_eq!(consumer.stats().fetch_retries, 2);
    assert!(pipeline.committed(P0).is_empty());
}

#[test]
fn test_dead_letter_sink_retry_and_failure() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, "garbage");
    pipeline
        .dead_letters
        .fail_next([DeadLetterError::Unavailable("journal busy".into())]);

    let summary = pipeline.consumer(config(P0)).run().unwrap();
    assert_eq!(summary.stats.records_dead_lettered, 1);
    assert_eq!(pipeline.committed(P0), vec![0]);

    let pipeline = Pipeline::new();
    pipeline.push(P0, "garbage");
    pipeline
        .dead_letters
        .fail_next([DeadLetterError::Encoding("unserializable".into())]);

    let err = pipeline.consumer(config(P0)).run().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DeadLetter {
            offset: 0,
            attempts: 1,
            ..
        }
    ));
    assert!(pipeline.committed(P0).is_empty());
}

#[test]
fn test_offset_gaps_are_accepted() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline
        .log
        .append_at(P0, 10, event(2, "beta").into_bytes());

    pipeline.consumer(config(P0)).run().unwrap();

    assert_eq!(pipeline.committed(P0), vec![0, 10]);
    let doc = pipeline
        .store
        .get("messages", &DocumentKey::new("event-2"))
        .unwrap()
        .unwrap();
    assert_eq!(doc.source.map(|p| p.offset), Some(10));
}

#[test]
fn test_retention_moves_starting_point() {
    let pipeline = Pipeline::new();
    for id in 1..=6 {
        pipeline.push(P0, &event(id, "alpha"));
    }
    pipeline.log.truncate_before(P0, 4);
    assert_eq!(pipeline.log.earliest_offset(P0).unwrap(), 4);

    pipeline.consumer(config(P0)).run().unwrap();
    assert_eq!(pipeline.ids(), vec![5, 6]);
}

#[test]
fn test_offset_aware_keys_keep_every_delivery() {
    let pipeline = Pipeline::new();
    pipeline.push(P0, &event(1, "alpha"));
    pipeline.push(P0, &event(1, "beta"));

    let sink = SinkConfig::new("messages").with_key_strategy(KeyStrategy::EventIdAndOffset);
    pipeline.consumer_with_sink(config(P0), sink).run().unwrap();

    assert_eq!(pipeline.store.count("messages").unwrap(), 2);
    assert!(pipeline
        .store
        .get("messages", &DocumentKey::new("event-1-p0-o1"))
        .unwrap()
        .is_some());
}

#[test]
fn test_partitions_run_on_separate_threads() {
    let pipeline = Pipeline::new();
    for id in 0..20 {
        pipeline.push(P0, &event(id, "alpha"));
        pipeline.push(P1, &event(100 + id, "beta"));
    }

    let consumers = [pipeline.consumer(config(P0)), pipeline.consumer(config(P1))];
    let summaries: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = consumers
            .iter()
            .map(|consumer| scope.spawn(move || consumer.run()))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect()
    });

    assert!(summaries.iter().all(|s| s.stats.records_persisted == 20));
    assert_eq!(pipeline.store.count("messages").unwrap(), 40);
    assert_eq!(pipeline.committed(P0), (0..20).collect::<Vec<u64>>());
    assert_eq!(pipeline.committed(P1), (0..20).collect::<Vec<u64>>());
}

#[test]
fn test_waiting_consumer_picks_up_late_records() {
    let pipeline = Pipeline::new();
    let consumer = pipeline.consumer(
        config(P0)
            .with_stop_when_idle(false)
            .with_fetch_timeout(Duration::from_millis(20)),
    );
    let signal = consumer.shutdown_signal().clone();
    let log = Arc::clone(&pipeline.log);
    let offsets = Arc::clone(&pipeline.offsets);

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        log.append(P0, event(7, "gamma").into_bytes());
        let deadline = Instant::now() + Duration::from_secs(5);
        while offsets.history().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        signal.trigger();
    });

    let summary = consumer.run().unwrap();
    producer.join().unwrap();

    assert_eq!(summary.cause, StopCause::Shutdown);
    assert_eq!(pipeline.ids(), vec![7]);
    assert_eq!(pipeline.committed(P0), vec![0]);
}
