//! Completion handles: a waitable (condition variable plus return code)
//! and a fire-and-forget callback.

use parking_lot::{Condvar, Mutex};

pub trait CompletionHandle: Send + Sync {
    fn complete(&self, return_code: i32);
}

#[derive(Default)]
pub struct WaitHandle {
    state: Mutex<State>,
    condition: Condvar,
}

#[derive(Default)]
struct State {
    return_code: i32,
    done: bool,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a worker completes this handle and returns its code.
    pub fn wait(&self) -> i32 {
        let mut state = self.state.lock();

        while !state.done {
            self.condition.wait(&mut state);
        }

        state.return_code
    }
}

impl CompletionHandle for WaitHandle {
    fn complete(&self, return_code: i32) {
        let mut state = self.state.lock();

        state.return_code = return_code;
        state.done = true;

        self.condition.notify_all();
    }
}

pub struct CallbackHandle {
    callback: Box<dyn Fn(i32) + Send + Sync>,
}

impl CallbackHandle {
    pub fn new(callback: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl CompletionHandle for CallbackHandle {
    fn complete(&self, return_code: i32) {
        (self.callback)(return_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_completion_code() {
        let handle = Arc::new(WaitHandle::new());
        let signaller = handle.clone();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.complete(-libc::ENOENT);
        });

        assert_eq!(handle.wait(), -libc::ENOENT);
        t.join().unwrap();
    }

    #[test]
    fn wait_after_completion_does_not_block() {
        let handle = WaitHandle::new();
        handle.complete(17);
        assert_eq!(handle.wait(), 17);
        assert_eq!(handle.wait(), 17);
    }

    #[test]
    fn callback_fires() {
        let seen = Arc::new(AtomicI32::new(0));
        let inner = seen.clone();
        let handle = CallbackHandle::new(move |rc| inner.store(rc, Ordering::SeqCst));

        handle.complete(-libc::EIO);
        assert_eq!(seen.load(Ordering::SeqCst), -libc::EIO);
    }
}
