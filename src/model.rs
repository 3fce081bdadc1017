//! Event model: one replayable statement in, one observed outcome out.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position of an event within a streaming source. `None` for file-sourced
/// events, which have no partition/offset concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocator {
    pub partition: i32,
    pub offset: i64,
}

/// One replayable statement, already normalized out of whatever the source
/// reader decoded (file JSON line or Kafka message).
#[derive(Debug, Clone)]
pub struct Event {
    /// Opaque routing key. Same value always routes to the same worker.
    pub session_id: u64,
    pub sql: String,
    /// Instant the event was captured, at microsecond precision. `None`
    /// when pacing is disabled and the source skipped timestamp parsing.
    pub ts: Option<Duration>,
    /// Database to establish the worker's first connection against. Only
    /// consulted on worker creation; later schema changes happen only via
    /// SQL the stream itself carries (USE statements).
    pub initial_db: Option<String>,
    /// Original captured query duration and rows-sent, carried through to
    /// the outcome record unchanged.
    pub query_time_us: i64,
    pub rows_sent: i64,
    /// Present only for streaming-sourced events.
    pub locator: Option<SourceLocator>,
}

/// Produced once per executed (or failed-to-execute) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub sql: String,
    pub query_time: i64,
    pub rows_sent: i64,
    pub execution_time: i64,
    pub rows_returned: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
    pub dbname: String,
}
