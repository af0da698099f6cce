//! The open-file handle table and the read/write/flush/close protocol.
//!
//! Handles are allocated monotonically. Opening a path that already has
//! an open-file entry clones a handle onto that entry; the staging file
//! and flags are shared. The `DIRTY`/`FLUSHING`/`IN_USE` flag dance
//! serializes flushes against I/O: colliding operations return `-EBUSY`
//! instead of blocking.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::base::timer;
use crate::fs::cache;
use crate::fs::object::ObjectType;
use crate::fs::open_file::{OpenFile, Status};
use crate::services;
use crate::threads::pool::{self, RequestPool};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Skip the download and start from an empty, dirty staging file.
        const TRUNCATE_TO_ZERO = 0x1;
    }
}

struct Inner {
    /// entry id -> shared entry (owning)
    entries: HashMap<u64, Arc<OpenFile>>,
    /// handle -> entry id
    handles: HashMap<u64, u64>,
    next_id: u64,
}

struct OpenFileMap {
    inner: Mutex<Inner>,
}

static STATE: RwLock<Option<Arc<OpenFileMap>>> = RwLock::new(None);

pub fn init() {
    *STATE.write() = Some(Arc::new(OpenFileMap {
        inner: Mutex::new(Inner {
            entries: HashMap::new(),
            handles: HashMap::new(),
            next_id: 1,
        }),
    }));
}

pub fn terminate() {
    *STATE.write() = None;
}

fn state() -> Arc<OpenFileMap> {
    STATE.read().clone().expect("open-file map not initialized")
}

fn entry_for_handle(handle: u64) -> Option<(u64, Arc<OpenFile>)> {
    let state = state();
    let inner = state.inner.lock();

    let entry_id = *inner.handles.get(&handle)?;
    let entry = inner.entries.get(&entry_id)?.clone();

    Some((entry_id, entry))
}

fn io_errno(error: &std::io::Error) -> i32 {
    -error.raw_os_error().unwrap_or(libc::EIO)
}

/// Opens `path`, downloading the blob into a staging file unless the
/// caller asked for truncation. Returns the new handle.
pub fn open(path: &str, flags: OpenFlags) -> Result<u64, i32> {
    let Some(object) = cache::get_with_hint(path, cache::Hint::IsFile) else {
        return Err(-libc::ENOENT);
    };

    match object.object_type() {
        ObjectType::File => {}
        ObjectType::Directory => return Err(-libc::EISDIR),
        _ => return Err(-libc::EINVAL),
    }

    let truncate = flags.contains(OpenFlags::TRUNCATE_TO_ZERO);
    let map = state();

    let (entry_id, entry) = {
        let mut inner = map.inner.lock();

        // clones share the existing entry
        if let Some(entry_id) = object.open_file_id() {
            if let Some(entry) = inner.entries.get(&entry_id).cloned() {
                entry.state().ref_count += 1;

                let handle = inner.next_id;
                inner.next_id += 1;
                inner.handles.insert(handle, entry_id);

                return Ok(handle);
            }
        }

        let entry = match OpenFile::new(object.clone()) {
            Ok(entry) => Arc::new(entry),
            Err(e) => {
                warn!("failed to create staging file for [{path}]: {e}");
                return Err(io_errno(&e));
            }
        };

        let entry_id = inner.next_id;
        inner.next_id += 1;

        inner.entries.insert(entry_id, entry.clone());
        inner.handles.insert(entry_id, entry_id);
        object.set_open_file_id(Some(entry_id));

        if truncate {
            entry.state().status |= Status::DIRTY;
        }

        (entry_id, entry)
    };

    if !truncate {
        let transfer = services::get().file_transfer();
        let url = object.url().to_string();
        let size = object.size();
        let staging = entry.staging().clone();

        let rc = pool::call(RequestPool::Primary, move |req| {
            transfer.download(req, &url, size, &staging)
        });

        if rc != 0 {
            debug!("download of [{path}] failed with {rc}");

            let mut inner = map.inner.lock();
            object.set_open_file_id(None);
            inner.entries.remove(&entry_id);
            inner.handles.remove(&entry_id);

            return Err(rc);
        }
    }

    Ok(entry_id)
}

/// Reads from the staging file. Returns bytes read or a negative errno;
/// `-EBUSY` while a flush is in progress.
pub fn read(handle: u64, buffer: &mut [u8], offset: u64) -> i32 {
    let Some((_, entry)) = entry_for_handle(handle) else {
        return -libc::EINVAL;
    };

    {
        let mut state = entry.state();

        if state.status.contains(Status::FLUSHING) {
            return -libc::EBUSY;
        }

        state.status |= Status::IN_USE;
    }

    let result = nix::sys::uio::pread(&**entry.staging(), buffer, offset as i64);

    let mut state = entry.state();
    state.status.remove(Status::IN_USE);

    match result {
        Ok(n) => n as i32,
        Err(errno) => -(errno as i32),
    }
}

/// Writes to the staging file and marks the entry dirty.
pub fn write(handle: u64, buffer: &[u8], offset: u64) -> i32 {
    let Some((_, entry)) = entry_for_handle(handle) else {
        return -libc::EINVAL;
    };

    {
        let mut state = entry.state();

        if state.status.contains(Status::FLUSHING) {
            return -libc::EBUSY;
        }

        state.status |= Status::IN_USE;
    }

    let result = nix::sys::uio::pwrite(&**entry.staging(), buffer, offset as i64);

    let mut state = entry.state();
    state.status.remove(Status::IN_USE);
    state.status |= Status::DIRTY;

    match result {
        Ok(n) => n as i32,
        Err(errno) => -(errno as i32),
    }
}

/// Truncates the staging file; follows the write rules.
pub fn truncate(handle: u64, length: u64) -> i32 {
    let Some((_, entry)) = entry_for_handle(handle) else {
        return -libc::EINVAL;
    };

    {
        let mut state = entry.state();

        if state.status.contains(Status::FLUSHING) {
            return -libc::EBUSY;
        }

        state.status |= Status::IN_USE;
    }

    let result = nix::unistd::ftruncate(&**entry.staging(), length as i64);

    let mut state = entry.state();
    state.status.remove(Status::IN_USE);
    state.status |= Status::DIRTY;

    match result {
        Ok(()) => 0,
        Err(errno) => -(errno as i32),
    }
}

/// Uploads dirty bytes. With `close`, also tears the entry down and
/// expires the object so the next lookup sees the new content.
pub fn flush(handle: u64, close: bool) -> i32 {
    let Some((entry_id, entry)) = entry_for_handle(handle) else {
        return -libc::EINVAL;
    };

    let dirty = {
        let mut state = entry.state();

        if state.status.contains(Status::IN_USE) {
            return -libc::EBUSY;
        }

        if state.status.contains(Status::FLUSHING) {
            // another thread is already uploading; only a close needs to
            // report the collision
            return if close { -libc::EBUSY } else { 0 };
        }

        state.status |= Status::FLUSHING;
        state.status.contains(Status::DIRTY)
    };

    // a clean flush still reports a transfer error that never cleared
    let rc = if dirty {
        upload(&entry)
    } else {
        entry.state().error
    };

    let map = state();
    let mut inner = map.inner.lock();
    let mut entry_state = entry.state();

    entry_state.status.remove(Status::FLUSHING);

    if rc == 0 {
        entry_state.status.remove(Status::DIRTY);
        entry_state.error = 0;

        if close {
            entry_state.ref_count = 0;
            drop(entry_state);

            inner.handles.remove(&handle);
            inner.entries.remove(&entry_id);

            entry.object().set_open_file_id(None);
            entry.object().expire();
        }
    } else {
        entry_state.error = rc;
    }

    rc
}

/// Drops one handle; the last one flushes and closes the entry.
pub fn release(handle: u64) -> i32 {
    let Some((_, entry)) = entry_for_handle(handle) else {
        return -libc::EINVAL;
    };

    {
        let map = state();
        let mut inner = map.inner.lock();
        let mut entry_state = entry.state();

        if entry_state.ref_count > 1 {
            entry_state.ref_count -= 1;
            drop(entry_state);

            inner.handles.remove(&handle);

            return 0;
        }
    }

    flush(handle, true)
}

fn upload(entry: &Arc<OpenFile>) -> i32 {
    let object = entry.object().clone();
    let staging = entry.staging().clone();

    let size = match staging.metadata() {
        Ok(metadata) => metadata.len(),
        Err(e) => return io_errno(&e),
    };

    object.set_size(size);
    object.set_mtime(timer::current_time());

    let transfer = services::get().file_transfer();

    let etag: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let upload_object = object.clone();
    let upload_etag = etag.clone();
    let rc = pool::call(RequestPool::Primary, move |req| {
        match transfer.upload(req, &upload_object, size, &staging) {
            Ok(new_etag) => {
                *upload_etag.lock() = Some(new_etag);
                0
            }
            Err(rc) => rc,
        }
    });

    if rc != 0 {
        return rc;
    }

    if let Some(new_etag) = etag.lock().clone() {
        if !new_etag.is_empty() {
            object.set_etag(&new_etag);
        }
    }

    // rewrite the remote metadata so it names the etag we just created
    let commit_object = object.clone();
    pool::call(RequestPool::Primary, move |req| commit_object.commit(req))
}
