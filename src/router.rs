//! Session router: maintains per-session workers and dispatches events to
//! the owning worker with backpressure (spec.md §4.2). Grounded on the
//! original Go tool's `PartitionRunner`, generalized per the spec from a
//! per-partition worker map to one process-wide session→worker mapping —
//! cross-session ordering is never required (spec.md §1 Non-goals), so a
//! single map is simpler than replicating the map per partition while
//! preserving every invariant spec.md actually demands.

use crate::model::{Event, SourceLocator};
use crate::worker::{self, RoutedEvent, WorkerContext, WorkerHandle};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct SessionRouter {
    workers: Arc<Mutex<HashMap<u64, WorkerHandle>>>,
    queue_capacity: usize,
    idle_ttl_secs: i64,
    ctx: WorkerContext,
}

impl SessionRouter {
    pub fn new(queue_capacity: usize, idle_ttl_secs: u64, ctx: WorkerContext) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            queue_capacity,
            idle_ttl_secs: idle_ttl_secs as i64,
            ctx,
        }
    }

    /// Number of session workers that have received an event and not yet
    /// terminated — spec.md §8 property 4.
    pub async fn active_session_count(&self) -> i64 {
        self.workers.lock().await.len() as i64
    }

    /// Connections currently executing or with a nonempty queue (spec.md §4.8).
    pub async fn busy_connection_count(&self) -> i64 {
        let workers = self.workers.lock().await;
        workers
            .values()
            .filter(|w| w.in_flight.load(Ordering::Relaxed) > 0 || !w.queue.capacity_available())
            .count() as i64
    }

    /// Looks up or lazily creates the worker for `event.session_id`, then
    /// enqueues. Blocks when the worker's queue is full, which is exactly
    /// the backpressure path spec.md §4.2 step 2 describes.
    pub async fn dispatch(&self, event: Event, locator: Option<SourceLocator>) {
        let queue = {
            let mut workers = self.workers.lock().await;
            let handle = workers.entry(event.session_id).or_insert_with(|| {
                worker::spawn(
                    event.session_id,
                    event.initial_db.clone(),
                    self.queue_capacity,
                    self.ctx.clone(),
                )
            });
            handle.queue.clone()
        };
        // Sent outside the map lock: enqueue may block on a full queue, and
        // holding the lock across that block would stall every other
        // session's dispatch and the idle sweep.
        let _ = queue.send(RoutedEvent { event, locator }).await;
    }

    /// Runs until `cancel` fires: every `IDLE_SWEEP_INTERVAL`, drops the
    /// sender half of any worker whose `last_active` exceeds the idle TTL
    /// and whose `in_flight` counter is zero. The router never preempts an
    /// in-flight execution — removal and the in-flight check happen under
    /// the same lock, so a worker can't be swept mid-dispatch.
    pub async fn run_idle_sweep(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep_once().await,
            }
        }
    }

    async fn sweep_once(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut workers = self.workers.lock().await;
        workers.retain(|_, w| {
            let idle_for = now - w.last_active.load(Ordering::Relaxed);
            let reap = idle_for > self.idle_ttl_secs && w.in_flight.load(Ordering::Relaxed) == 0;
            !reap
        });
    }

    /// On supervisor shutdown: drop every worker's sender, closing its
    /// queue, then wait for all in-flight tasks to finish draining (they
    /// observe the closed channel and return). Draining itself happens on
    /// the worker tasks, which the caller joins separately.
    pub async fn close_all(&self) {
        self.workers.lock().await.clear();
    }
}

/// `tokio::sync::mpsc::Sender` has no public "is full" probe pre-1.0-stable
/// across versions we pin, but `capacity()` tells us how many permits are
/// free; zero free means the queue is at capacity, which we report as "busy".
trait QueueFullness {
    fn capacity_available(&self) -> bool;
}

impl<T> QueueFullness for tokio::sync::mpsc::Sender<T> {
    fn capacity_available(&self) -> bool {
        self.capacity() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConnectionFactory;
    use crate::journal::ErrorJournal;
    use crate::metrics::ReplayMetrics;
    use crate::offset_tracker::OffsetTracker;
    use tokio::sync::mpsc;

    fn test_ctx(dir: &std::path::Path) -> WorkerContext {
        WorkerContext {
            connections: ConnectionFactory::new("not-a-valid-dsn", "default"),
            default_db: "default".into(),
            output_base_path: dir.join("out").to_string_lossy().to_string(),
            journal: Arc::new(ErrorJournal::new(dir)),
            offset_tracker: Arc::new(Mutex::new(OffsetTracker::new())),
            commit_tx: mpsc::channel(16).0,
            metrics: Arc::new(ReplayMetrics::new().unwrap()),
            gap_preserving: false,
            speed: 1.0,
            stop_on_error: false,
            cancel: CancellationToken::new(),
            fatal: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn ev(session_id: u64) -> Event {
        Event {
            session_id,
            sql: "select 1".into(),
            ts: None,
            initial_db: None,
            query_time_us: 0,
            rows_sent: 0,
            locator: None,
        }
    }

    #[tokio::test]
    async fn dispatch_creates_one_worker_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let router = SessionRouter::new(8, 3600, test_ctx(dir.path()));
        router.dispatch(ev(1), None).await;
        router.dispatch(ev(2), None).await;
        router.dispatch(ev(1), None).await;
        // allow spawned worker tasks to register in the map
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.active_session_count().await, 2);
    }

    #[tokio::test]
    async fn empty_session_never_creates_a_worker() {
        let dir = tempfile::tempdir().unwrap();
        let router = SessionRouter::new(8, 3600, test_ctx(dir.path()));
        assert_eq!(router.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn idle_sweep_does_not_reap_recently_active_workers() {
        let dir = tempfile::tempdir().unwrap();
        let router = SessionRouter::new(8, 3600, test_ctx(dir.path()));
        router.dispatch(ev(1), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.sweep_once().await;
        assert_eq!(router.active_session_count().await, 1);
    }
}
