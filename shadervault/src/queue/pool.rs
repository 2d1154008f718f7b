//! Worker-thread pool and priority-ordered pending queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::item::{Priority, WorkItem};

/// Default interval between idle-wait polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-worker initialization hook, called with the worker index before the
/// thread accepts work. Returning `false` aborts that worker; the pool
/// runs with fewer threads. Typical use: binding a shared GPU context to
/// the thread.
pub type WorkerInit = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// Configuration for a [`WorkQueue`].
#[derive(Clone)]
pub struct QueueConfig {
    /// Number of worker threads. Zero disables background execution:
    /// `queue()` then runs both phases inline on the calling thread.
    pub threads: usize,
    /// Interval between polls in [`WorkQueue::wait_until_idle`].
    pub poll_interval: Duration,
    /// Cancellation token, usually shared with the host's shutdown sequence.
    pub cancel: CancellationToken,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

impl QueueConfig {
    /// Set the number of worker threads (zero forces synchronous builds).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the idle-wait polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Share a cancellation token with the host.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Pending items ordered by (priority, insertion sequence).
///
/// Iteration order within one priority happens to be insertion order;
/// callers must not rely on it.
struct PendingQueue<T> {
    items: BTreeMap<(Priority, u64), T>,
    next_seq: u64,
}

impl<T> PendingQueue<T> {
    fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, item: T, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.insert((priority, seq), item);
    }

    fn pop_first(&mut self) -> Option<T> {
        self.items.pop_first().map(|(_, item)| item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// A finished item waiting to be drained.
struct Completed<T> {
    item: T,
    retrieved: bool,
}

struct Shared<T> {
    pending: Mutex<PendingQueue<T>>,
    work_available: Condvar,
    completed: Mutex<VecDeque<Completed<T>>>,
    /// Workers currently executing `compile()`. Incremented while the
    /// pending lock is held so `pending + busy` never falsely dips to zero.
    busy: AtomicUsize,
    /// Items ever queued / ever finished; both monotonic.
    queued_total: AtomicU64,
    finished_total: AtomicU64,
    /// Internal stop flag; cleared again when the pool restarts.
    shutdown: AtomicBool,
    /// Host cancellation; terminal.
    cancel: CancellationToken,
}

/// Priority-ordered job queue with a fixed pool of worker threads.
///
/// With zero configured threads the queue degrades to a synchronous mode:
/// `queue()` runs both phases inline on the calling thread, which in that
/// mode is also the owning thread. With a non-zero configuration, items
/// queued before [`WorkQueue::start`] simply wait for the pool.
pub struct WorkQueue<T: WorkItem> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active_workers: AtomicUsize,
    threads: usize,
    poll_interval: Duration,
}

impl<T: WorkItem> WorkQueue<T> {
    /// Creates an empty queue with no workers running.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(PendingQueue::new()),
                work_available: Condvar::new(),
                completed: Mutex::new(VecDeque::new()),
                busy: AtomicUsize::new(0),
                queued_total: AtomicU64::new(0),
                finished_total: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                cancel: config.cancel,
            }),
            workers: Mutex::new(Vec::new()),
            active_workers: AtomicUsize::new(0),
            threads: config.threads,
            poll_interval: config.poll_interval,
        }
    }

    /// Spawns the configured worker threads and returns how many actually
    /// started.
    ///
    /// Each worker runs the optional init hook before signalling
    /// readiness; a failed hook aborts that worker and the pool runs
    /// short. `start` returns once every spawned thread has either
    /// signalled readiness or aborted.
    pub fn start(&self, init: Option<WorkerInit>) -> usize {
        if self.threads == 0 {
            return 0;
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::channel();
        {
            let mut workers = self.workers.lock().unwrap();
            for index in 0..self.threads {
                let shared = Arc::clone(&self.shared);
                let init = init.clone();
                let ready = ready_tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("compile-worker-{index}"))
                    .spawn(move || {
                        if let Some(hook) = init {
                            if !hook(index) {
                                tracing::warn!(worker = index, "worker init hook failed, thread aborting");
                                let _ = ready.send(false);
                                return;
                            }
                        }
                        let _ = ready.send(true);
                        worker_loop(shared);
                    })
                    .expect("failed to spawn compile worker thread");
                workers.push(handle);
            }
        }
        drop(ready_tx);

        let mut started = 0;
        while let Ok(ok) = ready_rx.recv() {
            if ok {
                started += 1;
            }
        }
        self.active_workers.fetch_add(started, Ordering::SeqCst);
        tracing::debug!(requested = self.threads, started, "compile worker pool started");
        started
    }

    /// Stops all workers and joins them.
    ///
    /// An in-flight `compile()` runs to completion before its worker
    /// exits; cancellation is only observed between items. Idempotent.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Taking the pending lock ensures no worker is between its stop
        // check and its condvar wait when we notify.
        drop(self.shared.pending.lock().unwrap());
        self.shared.work_available.notify_all();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.active_workers.store(0, Ordering::SeqCst);
    }

    /// Enqueues an item at the given priority.
    ///
    /// With zero configured threads both phases run inline on the calling
    /// thread and the item lands on the completed list already retrieved.
    pub fn queue(&self, mut item: T, priority: Priority) {
        self.shared.queued_total.fetch_add(1, Ordering::SeqCst);

        if self.threads == 0 {
            let _ = item.compile();
            item.retrieve();
            self.shared.finished_total.fetch_add(1, Ordering::SeqCst);
            self.shared.completed.lock().unwrap().push_back(Completed {
                item,
                retrieved: true,
            });
            return;
        }

        self.shared.pending.lock().unwrap().push(item, priority);
        self.shared.work_available.notify_one();
    }

    /// Removes all finished items, invokes `retrieve()` for each in FIFO
    /// completion order, and hands the items back.
    ///
    /// Must be called from the owning thread; this is the only place
    /// results are published.
    pub fn drain_completed(&self) -> Vec<T> {
        let drained: Vec<Completed<T>> = {
            let mut completed = self.shared.completed.lock().unwrap();
            completed.drain(..).collect()
        };
        drained
            .into_iter()
            .map(|mut done| {
                if !done.retrieved {
                    done.item.retrieve();
                }
                done.item
            })
            .collect()
    }

    /// Queued plus in-flight items.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len() + self.shared.busy.load(Ordering::SeqCst)
    }

    /// True while any item is queued or executing.
    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// True while finished items are waiting to be drained.
    pub fn has_completed(&self) -> bool {
        !self.shared.completed.lock().unwrap().is_empty()
    }

    /// Monotonic (finished, queued) counters for progress reporting.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.shared.finished_total.load(Ordering::SeqCst),
            self.shared.queued_total.load(Ordering::SeqCst),
        )
    }

    /// Number of workers currently accepting work.
    pub fn worker_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// The cancellation token observed by workers and idle waits.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Blocks until no work is queued or in flight, polling at the
    /// configured interval.
    ///
    /// `progress` receives monotonically non-decreasing `(done, total)`
    /// pairs between polls. Returns `false` if the cancellation token
    /// fires before the queue goes idle.
    pub fn wait_until_idle<F>(&self, mut progress: F) -> bool
    where
        F: FnMut(u64, u64),
    {
        loop {
            if self.shared.cancel.is_cancelled() {
                return false;
            }
            let (done, total) = self.progress();
            progress(done, total);
            if self.pending_count() == 0 {
                return true;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Discards all queued and completed items without retrieving them,
    /// and resets the progress counters.
    ///
    /// Only meaningful while the pool is stopped.
    pub fn clear(&self) {
        self.shared.pending.lock().unwrap().clear();
        self.shared.completed.lock().unwrap().clear();
        self.shared.queued_total.store(0, Ordering::SeqCst);
        self.shared.finished_total.store(0, Ordering::SeqCst);
    }
}

impl<T: WorkItem> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<T: WorkItem>(shared: Arc<Shared<T>>) {
    loop {
        let mut pending = shared.pending.lock().unwrap();
        let mut item = loop {
            if shared.shutdown.load(Ordering::SeqCst) || shared.cancel.is_cancelled() {
                return;
            }
            if let Some(item) = pending.pop_first() {
                break item;
            }
            pending = shared.work_available.wait(pending).unwrap();
        };
        shared.busy.fetch_add(1, Ordering::SeqCst);
        drop(pending);

        let _ = item.compile();

        shared.completed.lock().unwrap().push_back(Completed {
            item,
            retrieved: false,
        });
        shared.finished_total.fetch_add(1, Ordering::SeqCst);
        shared.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Work item that records phase invocations.
    struct Probe {
        id: u32,
        ok: bool,
        delay: Duration,
        compiled: Arc<AtomicUsize>,
        retrieved: Arc<AtomicUsize>,
        order: Arc<StdMutex<Vec<u32>>>,
    }

    impl Probe {
        fn new(id: u32, counters: &Counters) -> Self {
            Self {
                id,
                ok: true,
                delay: Duration::ZERO,
                compiled: counters.compiled.clone(),
                retrieved: counters.retrieved.clone(),
                order: counters.order.clone(),
            }
        }

        fn failing(mut self) -> Self {
            self.ok = false;
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl WorkItem for Probe {
        fn compile(&mut self) -> bool {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.compiled.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.id);
            self.ok
        }

        fn retrieve(&mut self) {
            self.retrieved.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct Counters {
        compiled: Arc<AtomicUsize>,
        retrieved: Arc<AtomicUsize>,
        order: Arc<StdMutex<Vec<u32>>>,
    }

    fn new_queue(threads: usize) -> WorkQueue<Probe> {
        WorkQueue::new(
            QueueConfig::default()
                .with_threads(threads)
                .with_poll_interval(Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_zero_workers_runs_synchronously() {
        let queue = new_queue(0);
        let counters = Counters::default();

        queue.queue(Probe::new(1, &counters), Priority::ON_DEMAND);

        // Both phases ran inside queue(); no drain was needed for the
        // item's effects to be visible.
        assert_eq!(counters.compiled.load(Ordering::SeqCst), 1);
        assert_eq!(counters.retrieved.load(Ordering::SeqCst), 1);
        assert!(queue.has_completed());
        assert!(!queue.has_pending());

        // Draining hands the item back without retrieving it twice.
        let items = queue.drain_completed();
        assert_eq!(items.len(), 1);
        assert_eq!(counters.retrieved.load(Ordering::SeqCst), 1);
        assert!(!queue.has_completed());
    }

    #[test]
    fn test_start_with_zero_threads_is_a_no_op() {
        let queue = new_queue(0);
        assert_eq!(queue.start(None), 0);
        assert_eq!(queue.worker_count(), 0);
    }

    #[test]
    fn test_workers_process_items() {
        let queue = new_queue(2);
        assert_eq!(queue.start(None), 2);
        let counters = Counters::default();

        for id in 0..8 {
            queue.queue(Probe::new(id, &counters), Priority::PRECOMPILE);
        }
        assert!(queue.wait_until_idle(|_, _| {}));

        let items = queue.drain_completed();
        assert_eq!(items.len(), 8);
        assert_eq!(counters.compiled.load(Ordering::SeqCst), 8);
        assert_eq!(counters.retrieved.load(Ordering::SeqCst), 8);
        queue.stop();
    }

    #[test]
    fn test_priority_preference_with_single_worker() {
        let queue = new_queue(1);
        let counters = Counters::default();

        // Fill the queue before the worker runs, then let it drain; it
        // must pop lower values first.
        for id in 0..5 {
            queue.queue(Probe::new(id, &counters), Priority::PRECOMPILE);
        }
        for id in 100..102 {
            queue.queue(Probe::new(id, &counters), Priority::ON_DEMAND);
        }
        queue.start(None);
        assert!(queue.wait_until_idle(|_, _| {}));

        let order = counters.order.lock().unwrap().clone();
        assert_eq!(&order[..2], &[100, 101]);
        queue.stop();
    }

    #[test]
    fn test_drain_returns_items_in_completion_order() {
        let queue = new_queue(1);
        let counters = Counters::default();

        for id in 0..4 {
            queue.queue(Probe::new(id, &counters), Priority::PRECOMPILE);
        }
        queue.start(None);
        assert!(queue.wait_until_idle(|_, _| {}));

        let drained: Vec<u32> = queue.drain_completed().iter().map(|p| p.id).collect();
        let completed = counters.order.lock().unwrap().clone();
        assert_eq!(drained, completed);
        queue.stop();
    }

    #[test]
    fn test_wait_until_idle_progress_is_monotonic() {
        let queue = new_queue(2);
        queue.start(None);
        let counters = Counters::default();

        for id in 0..10 {
            queue.queue(
                Probe::new(id, &counters).with_delay(Duration::from_millis(2)),
                Priority::PRECOMPILE,
            );
        }

        let mut seen = Vec::new();
        assert!(queue.wait_until_idle(|done, total| seen.push((done, total))));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        let (done, total) = queue.progress();
        assert_eq!(done, 10);
        assert_eq!(total, 10);
        queue.stop();
    }

    #[test]
    fn test_cancelled_wait_returns_false() {
        let cancel = CancellationToken::new();
        let queue: WorkQueue<Probe> = WorkQueue::new(
            QueueConfig::default()
                .with_threads(1)
                .with_poll_interval(Duration::from_millis(1))
                .with_cancel_token(cancel.clone()),
        );
        queue.start(None);
        let counters = Counters::default();
        queue.queue(
            Probe::new(0, &counters).with_delay(Duration::from_millis(100)),
            Priority::ON_DEMAND,
        );

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            cancel.cancel();
        });
        assert!(!queue.wait_until_idle(|_, _| {}));
        canceller.join().unwrap();
        queue.stop();
    }

    #[test]
    fn test_stop_lets_in_flight_work_finish() {
        let queue = new_queue(1);
        queue.start(None);
        let counters = Counters::default();
        queue.queue(
            Probe::new(0, &counters).with_delay(Duration::from_millis(30)),
            Priority::ON_DEMAND,
        );
        // Give the worker time to pick the item up, then stop mid-build.
        thread::sleep(Duration::from_millis(5));
        queue.stop();

        assert_eq!(counters.compiled.load(Ordering::SeqCst), 1);
        assert_eq!(queue.drain_completed().len(), 1);
    }

    #[test]
    fn test_failed_compile_still_reaches_retrieve() {
        let queue = new_queue(1);
        queue.start(None);
        let counters = Counters::default();

        queue.queue(Probe::new(1, &counters).failing(), Priority::ON_DEMAND);
        assert!(queue.wait_until_idle(|_, _| {}));
        let items = queue.drain_completed();
        assert_eq!(items.len(), 1);
        assert_eq!(counters.compiled.load(Ordering::SeqCst), 1);
        assert_eq!(counters.retrieved.load(Ordering::SeqCst), 1);
        queue.stop();
    }

    #[test]
    fn test_failed_compile_reaches_retrieve_in_synchronous_mode() {
        let queue = new_queue(0);
        let counters = Counters::default();

        queue.queue(Probe::new(0, &counters).failing(), Priority::ON_DEMAND);
        assert_eq!(counters.retrieved.load(Ordering::SeqCst), 1);
        assert_eq!(queue.drain_completed().len(), 1);
    }

    #[test]
    fn test_init_hook_failure_shrinks_pool() {
        let queue = new_queue(3);
        let init: WorkerInit = Arc::new(|index| index == 0);
        assert_eq!(queue.start(Some(init)), 1);
        assert_eq!(queue.worker_count(), 1);

        let counters = Counters::default();
        for id in 0..4 {
            queue.queue(Probe::new(id, &counters), Priority::PRECOMPILE);
        }
        assert!(queue.wait_until_idle(|_, _| {}));
        assert_eq!(counters.compiled.load(Ordering::SeqCst), 4);
        queue.stop();
    }

    #[test]
    fn test_clear_discards_without_retrieve() {
        let queue = new_queue(0);
        let counters = Counters::default();
        queue.queue(Probe::new(0, &counters), Priority::ON_DEMAND);
        assert!(queue.has_completed());

        queue.clear();
        assert!(!queue.has_completed());
        assert_eq!(queue.progress(), (0, 0));
        // The item had already been retrieved inline by the synchronous
        // path; nothing further happened during clear.
        assert_eq!(counters.retrieved.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let queue = new_queue(1);
        queue.start(None);
        queue.stop();
        assert_eq!(queue.worker_count(), 0);

        assert_eq!(queue.start(None), 1);
        let counters = Counters::default();
        queue.queue(Probe::new(7, &counters), Priority::ON_DEMAND);
        assert!(queue.wait_until_idle(|_, _| {}));
        assert_eq!(counters.compiled.load(Ordering::SeqCst), 1);
        queue.stop();
    }
}
