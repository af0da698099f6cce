//! Compute pool worker.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::warn;

use crate::threads::work_item::ComputeWorkItem;
use crate::threads::work_item_queue::WorkItemQueue;

pub struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(queue: &Arc<WorkItemQueue<ComputeWorkItem>>) -> Self {
        let queue = Arc::downgrade(queue);

        let thread = thread::Builder::new()
            .name("pool-worker".to_string())
            .spawn(move || Self::work(queue))
            .expect("failed to spawn pool worker");

        Self {
            thread: Some(thread),
        }
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn work(queue: Weak<WorkItemQueue<ComputeWorkItem>>) {
        loop {
            // hold the queue only long enough to pop an item
            let item = match queue.upgrade() {
                Some(queue) => queue.next(),
                None => break,
            };

            let Some(item) = item else {
                break;
            };

            let function = item.function().clone();
            let return_code = catch_unwind(AssertUnwindSafe(|| function()))
                .unwrap_or_else(|_| {
                    warn!("worker function panicked");
                    -libc::ECANCELED
                });

            item.handle().complete(return_code);
        }
    }
}
