//! Pool work item queue: an unbounded FIFO with a shutdown flag.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

pub struct WorkItemQueue<T> {
    inner: Mutex<Inner<T>>,
    condition: Condvar,
}

struct Inner<T> {
    queue: VecDeque<T>,
    done: bool,
}

impl<T> Default for WorkItemQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkItemQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                done: false,
            }),
            condition: Condvar::new(),
        }
    }

    /// Blocks until an item is available. Returns `None` once the queue
    /// has been aborted; items posted after that are never served.
    pub fn next(&self) -> Option<T> {
        let mut inner = self.inner.lock();

        while !inner.done && inner.queue.is_empty() {
            self.condition.wait(&mut inner);
        }

        if inner.done {
            return None;
        }

        inner.queue.pop_front()
    }

    pub fn post(&self, item: T) {
        let mut inner = self.inner.lock();

        inner.queue.push_back(item);
        self.condition.notify_one();
    }

    pub fn abort(&self) {
        let mut inner = self.inner.lock();

        inner.done = true;
        self.condition.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = WorkItemQueue::new();

        queue.post(1);
        queue.post(2);
        queue.post(3);

        assert_eq!(queue.next(), Some(1));
        assert_eq!(queue.next(), Some(2));
        assert_eq!(queue.next(), Some(3));
    }

    #[test]
    fn next_blocks_until_post() {
        let queue = Arc::new(WorkItemQueue::new());
        let poster = queue.clone();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            poster.post(42);
        });

        assert_eq!(queue.next(), Some(42));
        t.join().unwrap();
    }

    #[test]
    fn abort_wakes_waiters() {
        let queue: Arc<WorkItemQueue<i32>> = Arc::new(WorkItemQueue::new());
        let waiter = queue.clone();

        let t = thread::spawn(move || waiter.next());

        thread::sleep(Duration::from_millis(10));
        queue.abort();

        assert_eq!(t.join().unwrap(), None);
    }

    #[test]
    fn post_after_abort_is_never_served() {
        let queue = WorkItemQueue::new();

        queue.post(1);
        queue.abort();
        queue.post(2);

        assert_eq!(queue.next(), None);
        assert_eq!(queue.next(), None);
    }
}
