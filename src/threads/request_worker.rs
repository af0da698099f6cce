//! Request pool worker: a thread that owns one long-lived HTTP request
//! object and executes queue items against it.
//!
//! The pool watchdog calls [`RequestWorker::check_timeout`] once per
//! second. A worker whose current run has exceeded the configured request
//! timeout loses its item (re-posted or failed with `-ETIMEDOUT`) and is
//! abandoned: its queue reference is severed so the thread exits when the
//! hung transfer finally returns, and the pool spawns a replacement.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::base::config;
use crate::base::request::{Request, RunTimer};
use crate::threads::work_item::RequestWorkItem;
use crate::threads::work_item_queue::WorkItemQueue;

static REPOSTED_ITEMS: AtomicU64 = AtomicU64::new(0);

pub fn reposted_items() -> u64 {
    REPOSTED_ITEMS.load(Ordering::SeqCst)
}

pub struct RequestWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    timer: Arc<RunTimer>,
}

struct State {
    queue: Weak<WorkItemQueue<RequestWorkItem>>,
    current: Option<RequestWorkItem>,
}

impl RequestWorker {
    pub fn spawn(queue: &Arc<WorkItemQueue<RequestWorkItem>>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: Arc::downgrade(queue),
                current: None,
            }),
            timer: Arc::new(RunTimer::new()),
        });

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("request-worker".to_string())
            .spawn(move || Self::work(worker_shared))
            .expect("failed to spawn request worker");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Called by the watchdog. Returns true if this worker's current item
    /// timed out and the worker should be replaced.
    pub fn check_timeout(&self) -> bool {
        let timeout = Duration::from_secs(config::get().request_timeout_in_s);
        let mut state = self.shared.state.lock();

        if !self.shared.timer.is_expired(timeout) {
            return false;
        }

        if let Some(item) = state.current.take() {
            let queue = state.queue.upgrade();

            match queue {
                Some(queue) if item.has_retries_left() => {
                    REPOSTED_ITEMS.fetch_add(1, Ordering::SeqCst);
                    queue.post(item.decrement_retry_counter());
                }
                _ => item.handle().complete(-libc::ETIMEDOUT),
            }
        }

        // sever the queue link; the hung thread exits once its transfer
        // returns
        state.queue = Weak::new();

        true
    }

    fn work(shared: Arc<Shared>) {
        let mut request = Request::new_with_timer(shared.timer.clone());

        loop {
            let item = {
                let queue = shared.state.lock().queue.upgrade();

                match queue {
                    Some(queue) => queue.next(),
                    None => break,
                }
            };

            let Some(item) = item else {
                break;
            };

            shared.state.lock().current = Some(item.clone());

            let function = item.function().clone();
            shared.timer.start();

            let return_code = catch_unwind(AssertUnwindSafe(|| function(&mut request)))
                .unwrap_or_else(|_| {
                    warn!("request worker function panicked");
                    -libc::ECANCELED
                });

            shared.timer.stop();

            // the watchdog may have taken the item away; if so its fate
            // is already decided
            if let Some(current) = shared.state.lock().current.take() {
                current.handle().complete(return_code);
            }
        }
    }
}
