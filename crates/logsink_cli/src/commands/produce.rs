//! Produce command implementation.

use crate::settings::Settings;
use chrono::Utc;
use logsink_engine::FileLog;
use logsink_model::{DecodedEvent, PartitionId, EVENT_NAMES};
use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::info;

/// What to produce.
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Events to append, or unlimited.
    pub count: Option<u64>,
    /// Pause between events.
    pub interval: Duration,
    /// Target partition.
    pub partition: u32,
    /// Make every K-th event malformed.
    pub malformed_every: Option<u64>,
}

/// Appends generated events until the count is reached or Ctrl-C.
pub async fn run(settings: &Settings, options: &ProduceOptions) -> Result<(), Box<dyn std::error::Error>> {
    let log = FileLog::open(&settings.log.path, &settings.log.topic)?;
    let mut appender = log.appender(PartitionId(options.partition))?;

    let mut produced = 0u64;
    loop {
        if options.count.is_some_and(|count| produced >= count) {
            break;
        }

        let sequence = produced + 1;
        let payload = if options.malformed_every.is_some_and(|k| k > 0 && sequence % k == 0) {
            malformed_payload(sequence)
        } else {
            event_payload()?
        };
        let record = appender.append(None, payload)?;
        info!(
            partition = options.partition,
            offset = record.offset,
            value = %String::from_utf8_lossy(&record.value),
            "produced"
        );
        produced += 1;

        if options.count.is_some_and(|count| produced >= count) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    println!("Produced {produced} event(s) to partition {}", options.partition);
    Ok(())
}

/// A well-formed event with a nanosecond id and a random name.
fn event_payload() -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let now = Utc::now();
    let id = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros());
    let name = EVENT_NAMES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("alpha");
    Ok(DecodedEvent::new(id, name, now).to_json()?)
}

/// An event without a timestamp, which the decoder rejects.
fn malformed_payload(sequence: u64) -> Vec<u8> {
    format!(r#"{{"id":{sequence},"name":"broken"}}"#).into_bytes()
}
