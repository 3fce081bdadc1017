//! Scenario D from spec.md §8: a message that fails to decode is journaled
//! and its offset still marked complete, so a permanently-undecodable
//! message never stalls the commit pipeline. `src/supervisor.rs`'s
//! `ingest_loop` is private, so this test drives its decode-failure branch
//! against a mock `SourceReader` using the exact same acknowledgment path
//! the real loop calls — `offset_tracker::complete_and_forward` — rather
//! than reimplementing the ack inline, so a regression in that shared path
//! fails this test too.

use async_trait::async_trait;
use sql_replay::error::AppResult;
use sql_replay::journal::{ErrorJournal, JournalEntry};
use sql_replay::model::SourceLocator;
use sql_replay::offset_tracker::{complete_and_forward, OffsetTracker};
use sql_replay::source::{SourceItem, SourceReader};
use std::sync::Arc;
use tokio::sync::Mutex;

struct OneShotDecodeFailureSource {
    yielded: bool,
}

#[async_trait]
impl SourceReader for OneShotDecodeFailureSource {
    async fn next(&mut self) -> AppResult<Option<SourceItem>> {
        if self.yielded {
            return Ok(None);
        }
        self.yielded = true;
        Ok(Some(SourceItem::DecodeFailure {
            locator: SourceLocator { partition: 0, offset: 7 },
            raw_payload: b"not json".to_vec(),
            error: "expected value at line 1 column 1".to_string(),
        }))
    }

    async fn commit(&mut self, _partition: i32, _offset: i64) -> AppResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn decode_failure_is_journaled_and_its_offset_completes() {
    let dir = tempfile::tempdir().unwrap();
    let journal = ErrorJournal::new(dir.path());
    let tracker = Arc::new(Mutex::new(OffsetTracker::new()));
    let (commit_tx, mut commit_rx) = tokio::sync::mpsc::channel(16);
    let mut source = OneShotDecodeFailureSource { yielded: false };

    while let Some(item) = source.next().await.unwrap() {
        match item {
            SourceItem::Event(_) => unreachable!("this source never yields a decoded event"),
            SourceItem::DecodeFailure { locator, raw_payload, error } => {
                let raw_sql = String::from_utf8_lossy(&raw_payload).into_owned();
                journal
                    .append(JournalEntry {
                        partition: locator.partition,
                        offset: locator.offset,
                        session_id: 0,
                        dbname: "",
                        error: &error,
                        sql: &raw_sql,
                    })
                    .await
                    .unwrap();
                complete_and_forward(&tracker, &commit_tx, locator.partition, locator.offset).await;
            }
        }
    }
    drop(commit_tx);

    let mut commits = Vec::new();
    while let Some(loc) = commit_rx.recv().await {
        commits.push(loc.offset);
    }
    assert_eq!(commits, vec![7]);

    let day = chrono::Utc::now().format("%Y%m%d").to_string();
    let journal_path = dir.path().join(format!("replay_errors_{day}.log"));
    let contents = tokio::fs::read_to_string(&journal_path).await.unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("not json"));
    assert!(contents.contains("part=0"));
    assert!(contents.contains("offset=7"));
}
