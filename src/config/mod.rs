pub mod file_mode;
pub mod stream_mode;

pub use file_mode::FileModeConfig;
pub use stream_mode::StreamModeConfig;

use crate::error::{AppError, AppResult};
use serde::Deserialize;

/// `auto|committed|earliest|latest` (spec.md §6). `Auto` and `Committed`
/// both resolve to "resume from the group's committed offset if one
/// exists, otherwise earliest" — kept as distinct variants because they're
/// distinct CLI-facing words even though the resulting reader behavior is
/// identical (matches the original Go tool's `StartKafkaReplay`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartPosition {
    Auto,
    Committed,
    Earliest,
    Latest,
}

impl std::str::FromStr for StartPosition {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "committed" => Ok(Self::Committed),
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(AppError::InvalidConfig(format!(
                "unknown start position '{other}' (expected auto|committed|earliest|latest)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaslMechanism {
    None,
    Plain,
    ScramSha256,
    ScramSha512,
}

impl std::str::FromStr for SaslMechanism {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "plain" => Ok(Self::Plain),
            "scram-sha256" => Ok(Self::ScramSha256),
            "scram-sha512" => Ok(Self::ScramSha512),
            other => Err(AppError::InvalidConfig(format!(
                "unsupported SASL mechanism: {other}"
            ))),
        }
    }
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Plain => "plain",
            Self::ScramSha256 => "scram-sha256",
            Self::ScramSha512 => "scram-sha512",
        }
    }
}

pub fn load_toml<T: serde::de::DeserializeOwned>(path: &str) -> AppResult<T> {
    let raw = std::fs::read_to_string(path)?;
    let cfg: T = toml::from_str(&raw)?;
    Ok(cfg)
}
