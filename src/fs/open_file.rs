//! Per-object open-file state.
//!
//! One entry exists per open object, shared by every handle open on it.
//! The working copy of the blob lives in an anonymous staging file that
//! vanishes with the last descriptor, crash included.

use std::fs::File;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::fs::object::Object;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// Staging file has bytes the remote store has not seen.
        const DIRTY = 0x1;
        /// An upload is in progress.
        const FLUSHING = 0x2;
        /// A read or write is in flight.
        const IN_USE = 0x4;
    }
}

pub(crate) struct EntryState {
    pub status: Status,
    /// Kernel-level opens against this object.
    pub ref_count: u32,
    /// Result of the last failed transfer, zero otherwise.
    pub error: i32,
}

pub struct OpenFile {
    object: Arc<Object>,
    staging: Arc<File>,
    state: Mutex<EntryState>,
}

impl OpenFile {
    pub(crate) fn new(object: Arc<Object>) -> std::io::Result<Self> {
        Ok(Self {
            object,
            staging: Arc::new(tempfile::tempfile()?),
            state: Mutex::new(EntryState {
                status: Status::empty(),
                ref_count: 1,
                error: 0,
            }),
        })
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    pub fn staging(&self) -> &Arc<File> {
        &self.staging
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }
}
