//! Outcome sink: appends one JSON-serialized outcome per line to a file
//! keyed by session identifier. Only one worker ever writes to a given
//! session's file, so no cross-worker contention exists and the file can
//! be kept open for the worker's whole lifetime.

use crate::error::AppResult;
use crate::model::Outcome;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// One open append-mode file per session. `open` is called once, on the
/// worker's first outcome; every subsequent write reuses the handle.
pub struct SessionOutcomeFile {
    file: File,
}

impl SessionOutcomeFile {
    pub async fn open(base_path: &str, session_id: u64) -> AppResult<Self> {
        let path = format!("{base_path}.{session_id}");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    /// Serializes and appends one outcome. A single `write_all` call means
    /// no interleaving can split a record even if writes from unrelated
    /// files happen to land on the same underlying descriptor table.
    pub async fn append(&mut self, outcome: &Outcome) -> AppResult<()> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_json_line_per_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("replay_out").to_string_lossy().to_string();

        let mut sink = SessionOutcomeFile::open(&base, 7).await.unwrap();
        sink.append(&Outcome {
            sql: "select 1".into(),
            query_time: 100,
            rows_sent: 1,
            execution_time: 50,
            rows_returned: 1,
            error_info: None,
            dbname: "d".into(),
        })
        .await
        .unwrap();
        sink.append(&Outcome {
            sql: "select 2".into(),
            query_time: 200,
            rows_sent: 2,
            execution_time: 60,
            rows_returned: 2,
            error_info: Some("boom".into()),
            dbname: "d".into(),
        })
        .await
        .unwrap();
        drop(sink);

        let contents = tokio::fs::read_to_string(format!("{base}.7")).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("select 1"));
        assert!(!lines[0].contains("error_info"));
        assert!(lines[1].contains("boom"));
    }
}
