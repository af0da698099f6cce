//! Units of work consumed by pool workers.
//!
//! The function is held behind an `Arc` so a hung item can be re-posted
//! by the watchdog while the abandoned worker is still inside it.

use std::sync::Arc;

use crate::base::request::Request;
use crate::threads::async_handle::CompletionHandle;

/// Executed on a request worker, with its long-lived HTTP request.
pub type RequestFunction = dyn Fn(&mut Request) -> i32 + Send + Sync;

/// Executed on a compute worker; no request attached.
pub type ComputeFunction = dyn Fn() -> i32 + Send + Sync;

pub const DEFAULT_RETRIES: u32 = 2;

pub struct WorkItem<F: ?Sized> {
    function: Arc<F>,
    handle: Arc<dyn CompletionHandle>,
    retries: u32,
}

pub type RequestWorkItem = WorkItem<RequestFunction>;
pub type ComputeWorkItem = WorkItem<ComputeFunction>;

impl<F: ?Sized> WorkItem<F> {
    pub fn new(function: Arc<F>, handle: Arc<dyn CompletionHandle>, retries: u32) -> Self {
        Self {
            function,
            handle,
            retries,
        }
    }

    pub fn function(&self) -> &Arc<F> {
        &self.function
    }

    pub fn handle(&self) -> &Arc<dyn CompletionHandle> {
        &self.handle
    }

    pub fn has_retries_left(&self) -> bool {
        self.retries > 0
    }

    /// The same item, one retry poorer; used when re-posting after a
    /// timeout.
    pub fn decrement_retry_counter(self) -> Self {
        Self {
            retries: self.retries.saturating_sub(1),
            ..self
        }
    }
}

impl<F: ?Sized> Clone for WorkItem<F> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            handle: self.handle.clone(),
            retries: self.retries,
        }
    }
}
