//! Session worker: executes one session's events serially on one dedicated
//! physical connection (spec.md §4.3, §4.9). Grounded on the original Go
//! tool's `idWorker.run`, generalized from a partition-scoped worker map to
//! one task per session owning its own bounded `mpsc::Receiver`.

use crate::db::{ConnectionFactory, SqlExecutor};
use crate::journal::{ErrorJournal, JournalEntry};
use crate::metrics::ReplayMetrics;
use crate::model::{Event, Outcome, SourceLocator};
use crate::offset_tracker::OffsetTracker;
use crate::sink::SessionOutcomeFile;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// One event routed to a worker, carrying its source locator (if any) so the
/// worker can notify the offset tracker on completion without a back-pointer
/// to the router (spec.md §9 — cyclic references are broken by forwarding
/// tokens, never reaching back).
pub struct RoutedEvent {
    pub event: Event,
    pub locator: Option<SourceLocator>,
}

/// Shared, cross-worker collaborators every session worker needs. Cloned
/// (cheap: all `Arc`) into each spawned task by the router.
#[derive(Clone)]
pub struct WorkerContext {
    pub connections: ConnectionFactory,
    pub default_db: String,
    pub output_base_path: String,
    pub journal: Arc<ErrorJournal>,
    pub offset_tracker: Arc<Mutex<OffsetTracker>>,
    pub commit_tx: mpsc::Sender<SourceLocator>,
    pub metrics: Arc<ReplayMetrics>,
    pub gap_preserving: bool,
    pub speed: f64,
    pub stop_on_error: bool,
    pub cancel: tokio_util::sync::CancellationToken,
    /// Set once, the instant stop-on-error cancels the pipeline, so the
    /// supervisor can report a nonzero exit code (spec.md §6 exit codes).
    pub fatal: Arc<AtomicBool>,
}

/// What the router tracks about a live worker without reaching into its
/// task. `last_active` and `in_flight` are read by the idle sweep; the
/// sweep may close `queue_closer` only when `in_flight == 0`.
pub struct WorkerHandle {
    pub queue: mpsc::Sender<RoutedEvent>,
    pub last_active: Arc<AtomicI64>,
    pub in_flight: Arc<AtomicI64>,
}

/// Spawns the worker task and returns the handle the router keeps in its
/// session map.
pub fn spawn(
    session_id: u64,
    initial_db: Option<String>,
    queue_capacity: usize,
    ctx: WorkerContext,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(queue_capacity);
    let last_active = Arc::new(AtomicI64::new(now_secs()));
    let in_flight = Arc::new(AtomicI64::new(0));

    let handle = WorkerHandle {
        queue: tx,
        last_active: last_active.clone(),
        in_flight: in_flight.clone(),
    };

    tokio::spawn(run(session_id, initial_db, rx, ctx, last_active, in_flight));

    handle
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// *idle* / *working* / *terminated* state machine from spec.md §4.9:
/// `last_active` updates on every dequeue; the in-flight counter is nonzero
/// only strictly around one execution. The loop exits (terminated) when the
/// router drops `tx`, closing `rx`.
async fn run(
    session_id: u64,
    initial_db: Option<String>,
    mut rx: mpsc::Receiver<RoutedEvent>,
    ctx: WorkerContext,
    last_active: Arc<AtomicI64>,
    in_flight: Arc<AtomicI64>,
) {
    let mut executor: Option<Box<dyn SqlExecutor>> = None;
    let mut bound_db: Option<String> = initial_db;
    let mut sink: Option<SessionOutcomeFile> = None;
    let mut last_ts: Option<Duration> = None;
    let mut last_exec_duration = Duration::ZERO;

    while let Some(routed) = rx.recv().await {
        last_active.store(now_secs(), Ordering::Relaxed);
        in_flight.store(1, Ordering::Relaxed);

        handle_event(
            session_id,
            routed,
            &ctx,
            &mut executor,
            &mut bound_db,
            &mut sink,
            &mut last_ts,
            &mut last_exec_duration,
        )
        .await;

        in_flight.store(0, Ordering::Relaxed);
        last_active.store(now_secs(), Ordering::Relaxed);
    }

    if executor.is_some() {
        ctx.metrics.dec_total_connections();
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_event(
    session_id: u64,
    routed: RoutedEvent,
    ctx: &WorkerContext,
    executor: &mut Option<Box<dyn SqlExecutor>>,
    bound_db: &mut Option<String>,
    sink: &mut Option<SessionOutcomeFile>,
    last_ts: &mut Option<Duration>,
    last_exec_duration: &mut Duration,
) {
    let RoutedEvent { event, locator } = routed;
    let partition = locator.map(|l| l.partition).unwrap_or(0);
    let offset = locator.map(|l| l.offset).unwrap_or(0);

    // A session's bound database is set exactly once, from the first event
    // that carries one; later events never override it (spec.md §3 invariants).
    if bound_db.is_none() {
        *bound_db = event.initial_db.clone();
    }
    let dbname = bound_db.clone().unwrap_or_else(|| ctx.default_db.clone());

    if executor.is_none() {
        match ctx.connections.dedicated_connection(&dbname).await {
            Ok(conn) => {
                *executor = Some(Box::new(conn));
                ctx.metrics.inc_total_connections();
            }
            Err(e) => {
                journal(ctx, partition, offset, session_id, &dbname, &format!("connection acquisition failed: {e}"), &event.sql).await;
                if locator.is_some() {
                    complete_locator(ctx, partition, offset).await;
                }
                return;
            }
        }
    }

    // Pacing: gap = (ts - last_ts) - last_exec_duration, divided by speed in
    // file-replay mode (spec.md §4.3). The first event of a session never
    // sleeps because `last_ts` starts `None`.
    if ctx.gap_preserving {
        if let (Some(ts), Some(prev)) = (event.ts, *last_ts) {
            if let Some(gap) = ts.checked_sub(prev).and_then(|d| d.checked_sub(*last_exec_duration)) {
                let scaled = if ctx.speed > 0.0 {
                    Duration::from_secs_f64(gap.as_secs_f64() / ctx.speed)
                } else {
                    gap
                };
                if !scaled.is_zero() {
                    tokio::time::sleep(scaled).await;
                }
            }
        }
    }
    *last_ts = event.ts;

    let exec = executor.as_mut().expect("connection established above");
    let t0 = std::time::Instant::now();
    let result = exec.execute(&event.sql).await;
    *last_exec_duration = t0.elapsed();

    let outcome = match result {
        Ok(report) => Outcome {
            sql: event.sql.clone(),
            query_time: event.query_time_us,
            rows_sent: event.rows_sent,
            execution_time: report.duration_us,
            rows_returned: report.rows_returned,
            error_info: None,
            dbname: dbname.clone(),
        },
        Err(e) => {
            journal(ctx, partition, offset, session_id, &dbname, &e.to_string(), &event.sql).await;
            Outcome {
                sql: event.sql.clone(),
                query_time: event.query_time_us,
                rows_sent: event.rows_sent,
                execution_time: 0,
                rows_returned: 0,
                error_info: Some(e.to_string()),
                dbname: dbname.clone(),
            }
        }
    };

    let failed = outcome.error_info.is_some();

    if sink.is_none() {
        match SessionOutcomeFile::open(&ctx.output_base_path, session_id).await {
            Ok(f) => *sink = Some(f),
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to open outcome sink");
            }
        }
    }
    if let Some(s) = sink.as_mut() {
        if let Err(e) = s.append(&outcome).await {
            tracing::error!(session_id, error = %e, "failed to write outcome record");
        }
    }

    if locator.is_some() {
        complete_locator(ctx, partition, offset).await;
    }

    if failed && ctx.stop_on_error {
        tracing::error!(session_id, "stop-on-error: cancelling pipeline after execution failure");
        ctx.fatal.store(true, Ordering::SeqCst);
        ctx.cancel.cancel();
    }
}

async fn journal(
    ctx: &WorkerContext,
    partition: i32,
    offset: i64,
    session_id: u64,
    dbname: &str,
    error: &str,
    sql: &str,
) {
    if let Err(e) = ctx
        .journal
        .append(JournalEntry {
            partition,
            offset,
            session_id,
            dbname,
            error,
            sql,
        })
        .await
    {
        tracing::error!(session_id, error = %e, "failed to write error journal entry");
    }
}

/// Marks the event's source locator complete in the offset tracker and
/// forwards every now-committable offset to the commit driver, in order.
async fn complete_locator(ctx: &WorkerContext, partition: i32, offset: i64) {
    crate::offset_tracker::complete_and_forward(&ctx.offset_tracker, &ctx.commit_tx, partition, offset).await;
}
