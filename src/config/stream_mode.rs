//! Configuration for `replay-stream` mode: a Kafka-style message queue of
//! SQL events consumed as a named group, replayed with ordered offset
//! commit.

use super::{SaslMechanism, StartPosition};
use crate::error::{AppError, AppResult};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamModeConfig {
    /// Bootstrap broker list, e.g. `["broker1:9092", "broker2:9092"]`.
    pub brokers: Vec<String>,
    pub topic: String,
    /// Consumer group id; carries the resumable committed position.
    pub group: String,
    #[serde(default = "default_start")]
    pub start: StartPosition,

    /// Target DSN without a database name.
    pub dsn: String,
    #[serde(default = "default_db")]
    pub default_db: String,

    #[serde(default = "default_queue_capacity")]
    pub session_queue_capacity: usize,
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// `chrono` strptime-style layout for the event timestamp string.
    #[serde(default = "default_ts_layout")]
    pub ts_layout: String,
    /// `"UTC"`, `"Local"`, or a fixed offset like `"+09:00"`.
    #[serde(default = "default_ts_location")]
    pub ts_location: String,
    #[serde(default = "default_true")]
    pub gap_preserving: bool,

    /// Output base path for per-session outcome files.
    pub output_base_path: String,
    #[serde(default = "default_error_log_dir")]
    pub error_log_dir: String,
    #[serde(default)]
    pub stop_on_error: bool,

    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: SaslMechanism,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub tls_enable: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,

    #[serde(default = "default_fetch_queue_cap")]
    pub fetch_queue_capacity: usize,
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch_size: usize,
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    #[serde(default = "default_commit_every")]
    pub commit_every: i64,
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    #[serde(default = "default_metrics_bind_addr")]
    pub metrics_bind_addr: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_start() -> StartPosition {
    StartPosition::Auto
}
fn default_db() -> String {
    String::new()
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_idle_ttl() -> u64 {
    3600
}
fn default_stats_interval() -> u64 {
    10
}
fn default_ts_layout() -> String {
    "%Y-%m-%d %H:%M:%S%.f".to_string()
}
fn default_ts_location() -> String {
    "UTC".to_string()
}
fn default_true() -> bool {
    true
}
fn default_error_log_dir() -> String {
    ".".to_string()
}
fn default_sasl_mechanism() -> SaslMechanism {
    SaslMechanism::None
}
fn default_fetch_queue_cap() -> usize {
    20_000
}
fn default_fetch_batch() -> usize {
    1_000
}
fn default_fetch_interval_ms() -> u64 {
    100
}
fn default_commit_every() -> i64 {
    1_000
}
fn default_commit_interval_ms() -> u64 {
    200
}
fn default_metrics_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl StreamModeConfig {
    pub fn load(path: &str) -> AppResult<Self> {
        let cfg: Self = super::load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.brokers.is_empty() {
            return Err(AppError::MissingConfig("brokers"));
        }
        if self.topic.trim().is_empty() {
            return Err(AppError::MissingConfig("topic"));
        }
        if self.group.trim().is_empty() {
            return Err(AppError::MissingConfig("group"));
        }
        if self.dsn.trim().is_empty() {
            return Err(AppError::MissingConfig("dsn"));
        }
        if self.output_base_path.trim().is_empty() {
            return Err(AppError::MissingConfig("output_base_path"));
        }
        if self.session_queue_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "session_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.fetch_queue_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "fetch_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.fetch_batch_size == 0 {
            return Err(AppError::InvalidConfig(
                "fetch_batch_size must be > 0".to_string(),
            ));
        }
        match self.sasl_mechanism {
            SaslMechanism::None => {}
            _ => {
                if self.sasl_username.is_none() || self.sasl_password.is_none() {
                    return Err(AppError::InvalidConfig(
                        "sasl_username and sasl_password are required when sasl_mechanism is set"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Redacted one-line summary safe to log at startup (never the
    /// password). Mirrors the original tool's `saslSummary` helper.
    pub fn sasl_summary(&self) -> String {
        match self.sasl_mechanism {
            SaslMechanism::None => "none".to_string(),
            mech => match &self.sasl_username {
                Some(u) if !u.is_empty() => format!("{}(user={u})", mech.as_str()),
                _ => mech.as_str().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StreamModeConfig {
        StreamModeConfig {
            brokers: vec!["localhost:9092".into()],
            topic: "slow-sql".into(),
            group: "sql-replay".into(),
            start: StartPosition::Auto,
            dsn: "mysql://u:p@h:3306/".into(),
            default_db: "".into(),
            session_queue_capacity: 64,
            idle_ttl_secs: 3600,
            stats_interval_secs: 10,
            ts_layout: default_ts_layout(),
            ts_location: "UTC".into(),
            gap_preserving: true,
            output_base_path: "replay_out".into(),
            error_log_dir: ".".into(),
            stop_on_error: false,
            sasl_mechanism: SaslMechanism::None,
            sasl_username: None,
            sasl_password: None,
            tls_enable: false,
            tls_skip_verify: false,
            fetch_queue_capacity: 20_000,
            fetch_batch_size: 1_000,
            fetch_interval_ms: 100,
            commit_every: 1_000,
            commit_interval_ms: 200,
            metrics_bind_addr: "0.0.0.0".into(),
            metrics_port: 9090,
        }
    }

    #[test]
    fn validates_clean_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_sasl_without_credentials() {
        let mut cfg = base();
        cfg.sasl_mechanism = SaslMechanism::Plain;
        assert!(cfg.validate().is_err());
        cfg.sasl_username = Some("u".into());
        cfg.sasl_password = Some("p".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sasl_summary_never_leaks_password() {
        let mut cfg = base();
        cfg.sasl_mechanism = SaslMechanism::ScramSha256;
        cfg.sasl_username = Some("alice".into());
        cfg.sasl_password = Some("super-secret".into());
        let summary = cfg.sasl_summary();
        assert!(summary.contains("alice"));
        assert!(!summary.contains("super-secret"));
    }
}
