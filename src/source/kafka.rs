//! Streaming source: consumes a Kafka-style topic as a named group, pulling
//! bounded batches into a shared FIFO ahead of dispatch, and committing
//! offsets the caller has marked durable. Grounded on the consumer/commit
//! shape in `examples/other_examples/..surreal-sync..consumer.rs.rs`,
//! generalized from a peek-buffer to a push-ahead fetch loop per the
//! original tool's `fetchLoop`/`commitLoop` split.

use crate::config::{SaslMechanism, StartPosition, StreamModeConfig};
use crate::error::{AppError, AppResult};
use crate::model::{Event, SourceLocator};
use crate::source::{SourceItem, SourceReader};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::{Offset, TopicPartitionList};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: JsonValue,
    query: String,
    #[serde(default)]
    ts: String,
    #[serde(default)]
    db: String,
}

pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    rx: mpsc::Receiver<OwnedMessage>,
    fetch_task: JoinHandle<()>,
    cancel: CancellationToken,
    topic: String,
    ts_layout: String,
    ts_location: String,
    gap_preserving: bool,
}

impl KafkaSource {
    pub async fn open(cfg: &StreamModeConfig) -> AppResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("group.id", &cfg.group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", auto_offset_reset(cfg.start));
        apply_security(&mut client_config, cfg)?;

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[cfg.topic.as_str()])?;
        let consumer = Arc::new(consumer);

        tracing::info!(
            brokers = %cfg.brokers.join(","),
            topic = %cfg.topic,
            group = %cfg.group,
            start = ?cfg.start,
            sasl = %cfg.sasl_summary(),
            tls = cfg.tls_enable,
            "kafka source starting"
        );

        let (tx, rx) = mpsc::channel(cfg.fetch_queue_capacity);
        let cancel = CancellationToken::new();
        let fetch_task = tokio::spawn(fetch_loop(
            consumer.clone(),
            cfg.fetch_batch_size,
            Duration::from_millis(cfg.fetch_interval_ms),
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            consumer,
            rx,
            fetch_task,
            cancel,
            topic: cfg.topic.clone(),
            ts_layout: cfg.ts_layout.clone(),
            ts_location: cfg.ts_location.clone(),
            gap_preserving: cfg.gap_preserving,
        })
    }

    fn decode(&self, msg: &OwnedMessage) -> Result<Event, String> {
        let payload = msg.payload().ok_or("empty payload")?;
        let wire: WireEvent = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        let session_id = parse_wire_id(&wire.id).map_err(|e| e.to_string())?;

        let ts = if self.gap_preserving {
            Some(
                parse_ts(&wire.ts, &self.ts_layout, &self.ts_location)
                    .map_err(|e| e.to_string())?,
            )
        } else {
            None
        };

        Ok(Event {
            session_id,
            sql: wire.query,
            ts,
            initial_db: if wire.db.is_empty() { None } else { Some(wire.db) },
            query_time_us: 0,
            rows_sent: 0,
            locator: Some(SourceLocator {
                partition: msg.partition(),
                offset: msg.offset(),
            }),
        })
    }
}

impl Drop for KafkaSource {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.fetch_task.abort();
    }
}

#[async_trait]
impl SourceReader for KafkaSource {
    async fn next(&mut self) -> AppResult<Option<SourceItem>> {
        let Some(msg) = self.rx.recv().await else {
            return Ok(None);
        };
        let locator = SourceLocator {
            partition: msg.partition(),
            offset: msg.offset(),
        };
        match self.decode(&msg) {
            Ok(event) => Ok(Some(SourceItem::Event(event))),
            Err(error) => Ok(Some(SourceItem::DecodeFailure {
                locator,
                raw_payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
                error,
            })),
        }
    }

    async fn commit(&mut self, partition: i32, offset: i64) -> AppResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
            .map_err(AppError::Kafka)?;
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Async)
            .map_err(AppError::Kafka)?;
        Ok(())
    }
}

async fn fetch_loop(
    consumer: Arc<StreamConsumer>,
    batch_size: usize,
    interval: Duration,
    tx: mpsc::Sender<OwnedMessage>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for _ in 0..batch_size {
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = consumer.recv() => {
                    match res {
                        Ok(borrowed) => {
                            if tx.send(borrowed.detach()).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "kafka fetch error, backing off");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn auto_offset_reset(start: StartPosition) -> &'static str {
    match start {
        StartPosition::Latest => "latest",
        // `Auto` and `Committed` both mean "resume from the group's
        // committed offset if one exists, otherwise earliest" — rdkafka
        // does this natively whenever a committed offset is present, so
        // both map to the same client-config fallback.
        StartPosition::Auto | StartPosition::Committed | StartPosition::Earliest => "earliest",
    }
}

fn apply_security(client_config: &mut ClientConfig, cfg: &StreamModeConfig) -> AppResult<()> {
    let security_protocol = match (cfg.tls_enable, cfg.sasl_mechanism) {
        (true, SaslMechanism::None) => "ssl",
        (true, _) => "sasl_ssl",
        (false, SaslMechanism::None) => "plaintext",
        (false, _) => "sasl_plaintext",
    };
    client_config.set("security.protocol", security_protocol);

    if cfg.tls_enable && cfg.tls_skip_verify {
        client_config.set("enable.ssl.certificate.verification", "false");
    }

    match cfg.sasl_mechanism {
        SaslMechanism::None => {}
        SaslMechanism::Plain => {
            client_config.set("sasl.mechanism", "PLAIN");
        }
        SaslMechanism::ScramSha256 => {
            client_config.set("sasl.mechanism", "SCRAM-SHA-256");
        }
        SaslMechanism::ScramSha512 => {
            client_config.set("sasl.mechanism", "SCRAM-SHA-512");
        }
    }
    if cfg.sasl_mechanism != SaslMechanism::None {
        let username = cfg
            .sasl_username
            .as_deref()
            .ok_or(AppError::MissingConfig("sasl_username"))?;
        let password = cfg
            .sasl_password
            .as_deref()
            .ok_or(AppError::MissingConfig("sasl_password"))?;
        client_config
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
    Ok(())
}

/// Tolerant of either a JSON number or a numeric string for `id`, since the
/// producing side sometimes serializes large ids as strings to dodge JS
/// number precision loss downstream.
fn parse_wire_id(v: &JsonValue) -> AppResult<u64> {
    match v {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| AppError::Decode(format!("id {n} is not a u64"))),
        JsonValue::String(s) => s
            .parse::<u64>()
            .map_err(|e| AppError::Decode(format!("id '{s}' is not a u64: {e}"))),
        other => Err(AppError::Decode(format!(
            "id must be a number or numeric string, got {other}"
        ))),
    }
}

fn parse_ts(raw: &str, layout: &str, location: &str) -> AppResult<Duration> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), layout)
        .map_err(|e| AppError::Decode(format!("parse ts '{raw}': {e}")))?;
    let dt: DateTime<Utc> = match location {
        "UTC" | "utc" => Utc.from_utc_datetime(&naive),
        "Local" | "local" => chrono::Local
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| AppError::Decode(format!("ambiguous local ts '{raw}'")))?
            .with_timezone(&Utc),
        offset => {
            let fixed = chrono::FixedOffset::from_str_offset(offset)
                .map_err(|e| AppError::Decode(format!("ts_location '{offset}': {e}")))?;
            fixed
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| AppError::Decode(format!("ambiguous ts '{raw}'")))?
                .with_timezone(&Utc)
        }
    };
    Ok(Duration::from_secs(dt.timestamp() as u64) + Duration::from_nanos(dt.timestamp_subsec_nanos() as u64))
}

/// Parses a fixed UTC offset like `+09:00` / `-05:30`; `chrono` has no
/// built-in parser for this shape on `FixedOffset` directly.
trait FixedOffsetExt {
    fn from_str_offset(s: &str) -> Result<chrono::FixedOffset, String>;
}

impl FixedOffsetExt for chrono::FixedOffset {
    fn from_str_offset(s: &str) -> Result<chrono::FixedOffset, String> {
        let s = s.trim();
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => return Err(format!("expected +HH:MM or -HH:MM, got '{s}'")),
        };
        let mut parts = rest.split(':');
        let hours: i32 = parts
            .next()
            .ok_or("missing hours")?
            .parse()
            .map_err(|_| "invalid hours".to_string())?;
        let minutes: i32 = parts.next().unwrap_or("0").parse().map_err(|_| "invalid minutes".to_string())?;
        let total_secs = sign * (hours * 3600 + minutes * 60);
        chrono::FixedOffset::east_opt(total_secs).ok_or_else(|| format!("offset out of range: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wire_id_accepts_number() {
        assert_eq!(parse_wire_id(&JsonValue::from(42u64)).unwrap(), 42);
    }

    #[test]
    fn parse_wire_id_accepts_numeric_string() {
        assert_eq!(
            parse_wire_id(&JsonValue::String("9876543210".into())).unwrap(),
            9876543210
        );
    }

    #[test]
    fn parse_wire_id_rejects_non_numeric_string() {
        assert!(parse_wire_id(&JsonValue::String("abc".into())).is_err());
    }

    #[test]
    fn parse_ts_utc_roundtrips_seconds() {
        let d = parse_ts("2024-01-02 03:04:05.500000", "%Y-%m-%d %H:%M:%S%.f", "UTC").unwrap();
        assert_eq!(d.as_secs(), 1704164645);
    }

    #[test]
    fn fixed_offset_parses_plus_and_minus() {
        assert_eq!(
            chrono::FixedOffset::from_str_offset("+09:00").unwrap().local_minus_utc(),
            9 * 3600
        );
        assert_eq!(
            chrono::FixedOffset::from_str_offset("-05:30").unwrap().local_minus_utc(),
            -(5 * 3600 + 30 * 60)
        );
    }
}
