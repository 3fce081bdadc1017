//! Error journal: append-only, one file per calendar day, tab-separated
//! lines carrying enough context to reproduce a failure (spec.md §4.7, §6).
//! Grounded on the original Go tool's `ErrorLogger`, generalized from a
//! lock-per-write reopen to a cached file handle that reopens only when the
//! UTC day rolls over.

use crate::error::AppResult;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One entry written on decode failure, connection-acquisition failure, or
/// SQL execution failure.
pub struct JournalEntry<'a> {
    pub partition: i32,
    pub offset: i64,
    pub session_id: u64,
    pub dbname: &'a str,
    pub error: &'a str,
    /// Trimmed SQL text, or the raw payload (lossy UTF-8) on decode failure.
    pub sql: &'a str,
}

struct OpenFile {
    day: String,
    file: File,
}

/// Writes are serialized by an internal mutex guarding the currently-open
/// handle; the handle is swapped out the first time an entry is appended on
/// a new UTC day.
pub struct ErrorJournal {
    dir: PathBuf,
    current: Mutex<Option<OpenFile>>,
}

impl ErrorJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: Mutex::new(None),
        }
    }

    pub async fn append(&self, entry: JournalEntry<'_>) -> AppResult<()> {
        let day = Utc::now().format("%Y%m%d").to_string();
        let mut guard = self.current.lock().await;

        if !matches!(&*guard, Some(f) if f.day == day) {
            let path = self.dir.join(format!("replay_errors_{day}.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;
            *guard = Some(OpenFile { day: day.clone(), file });
        }

        let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let line = format!(
            "{ts}\tpart={}\toffset={}\tid={}\tdb={}\terr={}\tSQL: {}\n",
            entry.partition,
            entry.offset,
            entry.session_id,
            entry.dbname,
            entry.error,
            entry.sql.trim(),
        );

        let open = guard.as_mut().expect("just opened above");
        open.file.write_all(line.as_bytes()).await?;
        open.file.flush().await?;
        Ok(())
    }
}
