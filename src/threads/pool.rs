//! Named worker pools.
//!
//! Three process-wide pools exist: a compute pool, and two request pools.
//! Foreground filesystem operations use the primary request pool; the
//! parallel pieces of chunked transfers go to the secondary pool so a
//! foreground item waiting on its chunks can never deadlock against them.
//!
//! Each request pool has a watchdog thread that once per second asks every
//! worker whether its current request has exceeded the configured timeout,
//! replacing the workers that have.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::base::request::Request;
use crate::base::statistics;
use crate::threads::async_handle::{CompletionHandle, WaitHandle};
use crate::threads::request_worker::{self, RequestWorker};
use crate::threads::work_item::{
    ComputeWorkItem, DEFAULT_RETRIES, RequestWorkItem, WorkItem,
};
use crate::threads::work_item_queue::WorkItemQueue;
use crate::threads::worker::Worker;

const NUM_THREADS_PER_POOL: usize = 8;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

static RESPAWNED_WORKERS: AtomicU64 = AtomicU64::new(0);

pub fn respawned_workers() -> u64 {
    RESPAWNED_WORKERS.load(Ordering::SeqCst)
}

/// The two pools that run request functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPool {
    /// Foreground: direct filesystem operations.
    Primary,
    /// Background: chunk and part transfers.
    Secondary,
}

struct RequestPoolImpl {
    name: &'static str,
    queue: Arc<WorkItemQueue<RequestWorkItem>>,
    workers: Mutex<Vec<RequestWorker>>,
}

impl RequestPoolImpl {
    fn new(name: &'static str) -> Arc<Self> {
        let queue = Arc::new(WorkItemQueue::new());
        let workers = (0..NUM_THREADS_PER_POOL)
            .map(|_| RequestWorker::spawn(&queue))
            .collect();

        Arc::new(Self {
            name,
            queue,
            workers: Mutex::new(workers),
        })
    }

    fn post(&self, item: RequestWorkItem) {
        self.queue.post(item);
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn check_timeouts(&self) {
        let mut workers = self.workers.lock();

        for slot in workers.iter_mut() {
            if slot.check_timeout() {
                debug!("pool [{}]: replacing timed-out worker", self.name);

                // the old worker is abandoned; dropping its handle
                // detaches the hung thread
                let _ = std::mem::replace(slot, RequestWorker::spawn(&self.queue));
                RESPAWNED_WORKERS.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn shutdown(&self) {
        self.queue.abort();

        for worker in self.workers.lock().drain(..) {
            worker.join();
        }
    }
}

struct ComputePoolImpl {
    queue: Arc<WorkItemQueue<ComputeWorkItem>>,
    workers: Mutex<Vec<Worker>>,
}

impl ComputePoolImpl {
    fn new() -> Self {
        let queue = Arc::new(WorkItemQueue::new());
        let workers = (0..NUM_THREADS_PER_POOL)
            .map(|_| Worker::spawn(&queue))
            .collect();

        Self {
            queue,
            workers: Mutex::new(workers),
        }
    }

    fn shutdown(&self) {
        self.queue.abort();

        for worker in self.workers.lock().drain(..) {
            worker.join();
        }
    }
}

struct Pools {
    compute: ComputePoolImpl,
    primary: Arc<RequestPoolImpl>,
    secondary: Arc<RequestPoolImpl>,
    watchdog_stop: Arc<(Mutex<bool>, Condvar)>,
    watchdogs: Mutex<Vec<JoinHandle<()>>>,
}

static POOLS: RwLock<Option<Arc<Pools>>> = RwLock::new(None);

fn spawn_watchdog(
    pool: Arc<RequestPoolImpl>,
    stop: Arc<(Mutex<bool>, Condvar)>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("watchdog-{}", pool.name))
        .spawn(move || {
            let (lock, condition) = &*stop;
            let mut stopped = lock.lock();

            loop {
                if *stopped {
                    break;
                }

                condition.wait_for(&mut stopped, WATCHDOG_INTERVAL);

                if *stopped {
                    break;
                }

                pool.check_timeouts();
            }
        })
        .expect("failed to spawn pool watchdog")
}

pub fn init() {
    let primary = RequestPoolImpl::new("request-primary");
    let secondary = RequestPoolImpl::new("request-secondary");
    let watchdog_stop = Arc::new((Mutex::new(false), Condvar::new()));

    let watchdogs = vec![
        spawn_watchdog(primary.clone(), watchdog_stop.clone()),
        spawn_watchdog(secondary.clone(), watchdog_stop.clone()),
    ];

    *POOLS.write() = Some(Arc::new(Pools {
        compute: ComputePoolImpl::new(),
        primary,
        secondary,
        watchdog_stop,
        watchdogs: Mutex::new(watchdogs),
    }));

    statistics::register("thread pools", |out| {
        use std::fmt::Write as _;

        let _ = writeln!(out, "thread pools:");
        let _ = writeln!(out, "  reposted items: {}", request_worker::reposted_items());
        let _ = writeln!(out, "  respawned workers: {}", respawned_workers());
    });
}

pub fn terminate() {
    let pools = POOLS.write().take();

    if let Some(pools) = pools {
        {
            let (lock, condition) = &*pools.watchdog_stop;
            *lock.lock() = true;
            condition.notify_all();
        }

        for watchdog in pools.watchdogs.lock().drain(..) {
            let _ = watchdog.join();
        }

        pools.primary.shutdown();
        pools.secondary.shutdown();
        pools.compute.shutdown();
    }
}

fn pools() -> Arc<Pools> {
    POOLS.read().clone().expect("thread pools not initialized")
}

fn request_pool(id: RequestPool) -> Arc<RequestPoolImpl> {
    let pools = pools();

    match id {
        RequestPool::Primary => pools.primary.clone(),
        RequestPool::Secondary => pools.secondary.clone(),
    }
}

/// Current worker count of a request pool; the watchdog keeps this at the
/// configured size.
pub fn pool_size(id: RequestPool) -> usize {
    request_pool(id).worker_count()
}

/// Queues `function` on a request pool; `handle` is signalled with its
/// return code.
pub fn post(
    id: RequestPool,
    function: impl Fn(&mut Request) -> i32 + Send + Sync + 'static,
    handle: Arc<dyn CompletionHandle>,
) {
    post_with_retries(id, function, handle, DEFAULT_RETRIES);
}

pub fn post_with_retries(
    id: RequestPool,
    function: impl Fn(&mut Request) -> i32 + Send + Sync + 'static,
    handle: Arc<dyn CompletionHandle>,
    retries: u32,
) {
    request_pool(id).post(WorkItem::new(Arc::new(function), handle, retries));
}

/// Queues `function` on a request pool and blocks for its return code.
pub fn call(id: RequestPool, function: impl Fn(&mut Request) -> i32 + Send + Sync + 'static) -> i32 {
    let handle = Arc::new(WaitHandle::new());

    post(id, function, handle.clone());
    handle.wait()
}

pub fn post_compute(
    function: impl Fn() -> i32 + Send + Sync + 'static,
    handle: Arc<dyn CompletionHandle>,
) {
    pools()
        .compute
        .queue
        .post(WorkItem::new(Arc::new(function), handle, DEFAULT_RETRIES));
}

pub fn call_compute(function: impl Fn() -> i32 + Send + Sync + 'static) -> i32 {
    let handle = Arc::new(WaitHandle::new());

    post_compute(function, handle.clone());
    handle.wait()
}
