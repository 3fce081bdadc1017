//! Supervisor: wires every component, owns lifecycle, prints periodic
//! stats, handles cancellation (spec.md §4.8). Grounded on the original Go
//! tool's `StartKafkaReplay`/`statsLoop`, generalized to share one pipeline
//! body across the file and streaming sources via the `SourceReader`
//! abstraction.

use crate::commit::CommitDriver;
use crate::config::{FileModeConfig, StreamModeConfig};
use crate::db::ConnectionFactory;
use crate::error::AppResult;
use crate::journal::{ErrorJournal, JournalEntry};
use crate::metrics::ReplayMetrics;
use crate::offset_tracker::OffsetTracker;
use crate::router::SessionRouter;
use crate::source::{FileSource, KafkaSource, SourceItem, SourceReader};
use crate::worker::WorkerContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

type SharedSource = Arc<Mutex<Box<dyn SourceReader>>>;

/// Runs `replay` mode (file source) until the input is exhausted or
/// `cancel` fires.
///
/// Returns `true` if stop-on-first-error fired during the run, so the
/// caller can set a nonzero exit code (spec.md §6).
pub async fn run_file(cfg: FileModeConfig, metrics: Arc<ReplayMetrics>, cancel: CancellationToken) -> AppResult<bool> {
    let source = FileSource::open(&cfg).await?;
    let journal = Arc::new(ErrorJournal::new(&cfg.error_log_dir));
    let offset_tracker = Arc::new(Mutex::new(OffsetTracker::new()));
    let (commit_tx, commit_rx) = mpsc::channel(1024);
    let ingest_commit_tx = commit_tx.clone();
    let fatal = Arc::new(AtomicBool::new(false));

    let ctx = WorkerContext {
        connections: ConnectionFactory::new(&cfg.dsn, &cfg.default_db),
        default_db: cfg.default_db.clone(),
        output_base_path: cfg.output_base_path.clone(),
        journal: journal.clone(),
        offset_tracker: offset_tracker.clone(),
        commit_tx,
        metrics: metrics.clone(),
        gap_preserving: cfg.gap_preserving,
        speed: cfg.speed,
        stop_on_error: cfg.stop_on_error,
        cancel: cancel.clone(),
        fatal: fatal.clone(),
    };
    let router = Arc::new(SessionRouter::new(cfg.session_queue_capacity, cfg.idle_ttl_secs, ctx));

    let source: SharedSource = Arc::new(Mutex::new(Box::new(source)));
    // File mode has no persisted cursor, so there's nothing to batch-commit
    // on; the driver still runs (its commits are simply no-ops on the
    // source) so the same pipeline shape serves both modes.
    let commit_driver = CommitDriver::new(source.clone(), 0, Duration::from_secs(3600));

    run_pipeline(
        source,
        router,
        commit_driver,
        commit_rx,
        ingest_commit_tx,
        journal,
        metrics,
        offset_tracker,
        Duration::from_secs(cfg.stats_interval_secs.max(1)),
        cancel,
    )
    .await;
    Ok(fatal.load(Ordering::SeqCst))
}

/// Runs `replay-stream` mode (Kafka source) until `cancel` fires.
///
/// Returns `true` if stop-on-first-error fired during the run, so the
/// caller can set a nonzero exit code (spec.md §6).
pub async fn run_stream(cfg: StreamModeConfig, metrics: Arc<ReplayMetrics>, cancel: CancellationToken) -> AppResult<bool> {
    let source = KafkaSource::open(&cfg).await?;
    let journal = Arc::new(ErrorJournal::new(&cfg.error_log_dir));
    let offset_tracker = Arc::new(Mutex::new(OffsetTracker::new()));
    let (commit_tx, commit_rx) = mpsc::channel(4096);
    let ingest_commit_tx = commit_tx.clone();
    let fatal = Arc::new(AtomicBool::new(false));

    let ctx = WorkerContext {
        connections: ConnectionFactory::new(&cfg.dsn, &cfg.default_db),
        default_db: cfg.default_db.clone(),
        output_base_path: cfg.output_base_path.clone(),
        journal: journal.clone(),
        offset_tracker: offset_tracker.clone(),
        commit_tx,
        metrics: metrics.clone(),
        gap_preserving: cfg.gap_preserving,
        speed: 1.0, // speed multiplier applies only to the file-replay source
        stop_on_error: cfg.stop_on_error,
        cancel: cancel.clone(),
        fatal: fatal.clone(),
    };
    let router = Arc::new(SessionRouter::new(cfg.session_queue_capacity, cfg.idle_ttl_secs, ctx));

    let source: SharedSource = Arc::new(Mutex::new(Box::new(source)));
    let commit_driver = CommitDriver::new(
        source.clone(),
        cfg.commit_every,
        Duration::from_millis(cfg.commit_interval_ms),
    );

    run_pipeline(
        source,
        router,
        commit_driver,
        commit_rx,
        ingest_commit_tx,
        journal,
        metrics,
        offset_tracker,
        Duration::from_secs(cfg.stats_interval_secs.max(1)),
        cancel,
    )
    .await;
    Ok(fatal.load(Ordering::SeqCst))
}

/// The part of the supervisor that's genuinely identical across modes:
/// spawn the idle sweep, the commit driver, the stats printer, run the
/// ingest loop on the current task, then drain everything on exit.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    source: SharedSource,
    router: Arc<SessionRouter>,
    commit_driver: CommitDriver<Box<dyn SourceReader>>,
    commit_rx: mpsc::Receiver<crate::model::SourceLocator>,
    commit_tx: mpsc::Sender<crate::model::SourceLocator>,
    journal: Arc<ErrorJournal>,
    metrics: Arc<ReplayMetrics>,
    offset_tracker: Arc<Mutex<OffsetTracker>>,
    stats_interval: Duration,
    cancel: CancellationToken,
) {
    let sweep_router = router.clone();
    let sweep_cancel = cancel.clone();
    let sweep_task = tokio::spawn(async move { sweep_router.run_idle_sweep(sweep_cancel).await });

    let commit_cancel = cancel.clone();
    let commit_task = tokio::spawn(commit_driver.run(commit_rx, commit_cancel));

    let stats_router = router.clone();
    let stats_source = source.clone();
    let stats_offset_tracker = offset_tracker.clone();
    let stats_cancel = cancel.clone();
    let stats_task = tokio::spawn(async move {
        run_stats_loop(stats_router, metrics, stats_offset_tracker, stats_source, stats_interval, stats_cancel).await
    });

    ingest_loop(source, router.clone(), journal, offset_tracker, commit_tx, cancel.clone()).await;

    router.close_all().await;
    cancel.cancel();
    let _ = sweep_task.await;
    let _ = commit_task.await;
    let _ = stats_task.await;
}

/// Pulls events from the source and dispatches them to the router until the
/// source is exhausted (file mode) or cancellation fires (spec.md's data
/// flow: "Source reader → ingress FIFO → Session router").
async fn ingest_loop(
    source: SharedSource,
    router: Arc<SessionRouter>,
    journal: Arc<ErrorJournal>,
    offset_tracker: Arc<Mutex<OffsetTracker>>,
    commit_tx: mpsc::Sender<crate::model::SourceLocator>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let item = {
            let mut src = source.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = src.next() => res,
            }
        };
        match item {
            Ok(Some(SourceItem::Event(event))) => {
                let locator = event.locator;
                router.dispatch(event, locator).await;
            }
            Ok(Some(SourceItem::DecodeFailure { locator, raw_payload, error })) => {
                tracing::warn!(partition = locator.partition, offset = locator.offset, error = %error, "decode failure, journaling and acking");
                let raw_sql = String::from_utf8_lossy(&raw_payload).into_owned();
                if let Err(e) = journal
                    .append(JournalEntry {
                        partition: locator.partition,
                        offset: locator.offset,
                        session_id: 0,
                        dbname: "",
                        error: &error,
                        sql: &raw_sql,
                    })
                    .await
                {
                    tracing::error!(error = %e, "failed to journal decode failure");
                }
                // A decode failure is still acknowledged: its offset must
                // advance so a permanently-undecodable message never stalls
                // every later offset on its partition (spec.md §4.1, §4.10).
                crate::offset_tracker::complete_and_forward(&offset_tracker, &commit_tx, locator.partition, locator.offset).await;
            }
            Ok(None) => return, // file source exhausted
            Err(e) => {
                tracing::error!(error = %e, "source reader error, stopping ingest");
                return;
            }
        }
    }
}

async fn run_stats_loop(
    router: Arc<SessionRouter>,
    metrics: Arc<ReplayMetrics>,
    offset_tracker: Arc<Mutex<OffsetTracker>>,
    source: SharedSource,
    interval: Duration,
    cancel: CancellationToken,
) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let active = router.active_session_count().await;
        let busy = router.busy_connection_count().await;
        let partitions = offset_tracker.lock().await.partition_count() as i64;
        let progress = source.lock().await.progress();

        metrics.set_active_sessions(active);
        metrics.set_busy_connections(busy);
        metrics.set_partitions_seen(partitions);

        let elapsed = start.elapsed().as_secs();
        match progress {
            Some((read, total)) => tracing::info!(
                active_sessions = active, busy_connections = busy, partitions, elapsed_secs = elapsed,
                bytes_read = read, bytes_total = total, "replay stats"
            ),
            None => tracing::info!(
                active_sessions = active, busy_connections = busy, partitions, elapsed_secs = elapsed, "replay stats"
            ),
        }
    }
}
