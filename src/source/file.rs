//! File source: reads newline-delimited slow-query records from a single
//! file already derived from a slow-query log, producing a lazy sequence of
//! events filtered by username, SQL kind, database name, and digest.

use crate::config::FileModeConfig;
use crate::error::AppResult;
use crate::model::Event;
use crate::source::{SourceItem, SourceReader};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
struct FileRecord {
    connection_id: String,
    query_time: i64,
    sql: String,
    rows_sent: i64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    sql_type: String,
    #[serde(default)]
    dbname: String,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    digest: String,
}

pub struct FileSource {
    lines: tokio::io::Lines<BufReader<File>>,
    ignore_log: File,
    filter_username: String,
    filter_sql_type: String,
    filter_dbname: String,
    ignore_digests: HashSet<String>,
    gap_preserving: bool,
    total_bytes: u64,
    bytes_read: u64,
}

impl FileSource {
    pub async fn open(cfg: &FileModeConfig) -> AppResult<Self> {
        let total_bytes = tokio::fs::metadata(&cfg.input_path).await?.len();
        let file = File::open(&cfg.input_path).await?;
        let ignore_log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.ignore_log_path)
            .await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            ignore_log,
            filter_username: cfg.filter_username.clone(),
            filter_sql_type: cfg.filter_sql_type.clone(),
            filter_dbname: cfg.filter_dbname.clone(),
            ignore_digests: cfg.load_ignore_digests()?,
            gap_preserving: cfg.gap_preserving,
            total_bytes,
            bytes_read: 0,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn passes_filters(&self, rec: &FileRecord) -> bool {
        if self.filter_username != "all" && rec.username != self.filter_username {
            return false;
        }
        if self.filter_sql_type != "all" && rec.sql_type != self.filter_sql_type {
            return false;
        }
        if self.filter_dbname != "all" && rec.dbname != self.filter_dbname {
            return false;
        }
        true
    }

    /// A record is only ever ignored by exact digest match; a record with
    /// no digest is never considered ignorable even if its SQL would
    /// normalize to a digest on the ignore list.
    fn is_ignored(&self, rec: &FileRecord) -> bool {
        !rec.digest.is_empty() && self.ignore_digests.contains(&rec.digest)
    }

    async fn log_ignored(&mut self, raw_line: &str) -> AppResult<()> {
        self.ignore_log.write_all(raw_line.as_bytes()).await?;
        self.ignore_log.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl SourceReader for FileSource {
    async fn next(&mut self) -> AppResult<Option<SourceItem>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            self.bytes_read += line.len() as u64 + 1;
            if line.trim().is_empty() {
                continue;
            }

            let rec: FileRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed file-source record");
                    continue;
                }
            };

            if self.is_ignored(&rec) {
                self.log_ignored(&line).await?;
                continue;
            }
            if !self.passes_filters(&rec) {
                continue;
            }

            let session_id = parse_session_id(&rec.connection_id);
            let ts = if self.gap_preserving {
                rec.ts.map(Duration::from_secs_f64)
            } else {
                None
            };
            let initial_db = if rec.dbname.is_empty() {
                None
            } else {
                Some(rec.dbname)
            };

            return Ok(Some(SourceItem::Event(Event {
                session_id,
                sql: rec.sql,
                ts,
                initial_db,
                query_time_us: rec.query_time,
                rows_sent: rec.rows_sent,
                locator: None,
            })));
        }
    }

    /// File mode has no persisted cursor: every run replays from the start.
    async fn commit(&mut self, _partition: i32, _offset: i64) -> AppResult<()> {
        Ok(())
    }

    fn progress(&self) -> Option<(u64, u64)> {
        Some((self.bytes_read, self.total_bytes))
    }
}

/// `connection_id` is nearly always a decimal string (the slow-log parser's
/// `Id:` capture); fall back to a stable hash for the rare non-numeric id
/// so routing stays deterministic within a run instead of failing closed.
fn parse_session_id(raw: &str) -> u64 {
    if let Ok(n) = raw.parse::<u64>() {
        return n;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    raw.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_connection_id_parses_directly() {
        assert_eq!(parse_session_id("42"), 42);
    }

    #[test]
    fn non_numeric_connection_id_hashes_deterministically() {
        let a = parse_session_id("conn-abc");
        let b = parse_session_id("conn-abc");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_less_record_is_never_ignored() {
        let cfg_digests: HashSet<String> = ["deadbeef".to_string()].into_iter().collect();
        let rec = FileRecord {
            connection_id: "1".into(),
            query_time: 1,
            sql: "select 1".into(),
            rows_sent: 0,
            username: "root".into(),
            sql_type: "select".into(),
            dbname: "d".into(),
            ts: Some(1.0),
            digest: String::new(),
        };
        // Simulate the exact-match-only rule directly, since FileSource
        // needs a live file handle to construct.
        assert!(!(!rec.digest.is_empty() && cfg_digests.contains(&rec.digest)));
    }
}
