//! Chunked transfer of file bodies between staging files and the remote
//! store.
//!
//! Small blobs move in one request on the caller's worker. Larger ones
//! are split into ranges, each submitted to the secondary request pool so
//! the waiting foreground item cannot deadlock against its own chunks.
//! Multipart uploads are service-specific; services without a multipart
//! protocol set an upload chunk size of zero and always upload in one
//! PUT.

use std::fs::File;
use std::sync::Arc;

use log::{debug, warn};

use crate::base::config;
use crate::base::request::{HTTP_OK, Method, Request, is_success};
use crate::fs::object::Object;
use crate::threads::async_handle::WaitHandle;
use crate::threads::pool::{self, RequestPool};

pub trait FileTransfer: Send + Sync {
    fn download_chunk_size(&self) -> u64 {
        config::get().download_chunk_size
    }

    /// Zero disables multipart uploads.
    fn upload_chunk_size(&self) -> u64 {
        config::get().upload_chunk_size
    }

    /// Fills `staging` with the remote body.
    fn download(&self, req: &mut Request, url: &str, size: u64, staging: &Arc<File>) -> i32 {
        if size > self.download_chunk_size() {
            self.download_multi(url, size, staging)
        } else {
            self.download_single(req, url, staging)
        }
    }

    fn download_single(&self, req: &mut Request, url: &str, staging: &Arc<File>) -> i32 {
        req.init(Method::Get);
        req.set_url(url, None);
        req.set_output_file(staging.clone(), 0);

        if let Err(e) = req.run() {
            warn!("download of [{url}] failed: {e}");
            return -libc::EIO;
        }

        if !is_success(req.response_code()) {
            debug!("download of [{url}] returned {}", req.response_code());
            return -libc::EIO;
        }

        0
    }

    /// Partitions `[0, size)` into ranged GETs on the secondary pool and
    /// waits for all of them.
    fn download_multi(&self, url: &str, size: u64, staging: &Arc<File>) -> i32 {
        let chunk_size = self.download_chunk_size();
        let mut waiters = Vec::new();
        let mut offset = 0;

        while offset < size {
            let len = chunk_size.min(size - offset);

            let chunk_url = url.to_string();
            let chunk_staging = staging.clone();
            let handle = Arc::new(WaitHandle::new());

            pool::post(
                RequestPool::Secondary,
                move |req| download_range(req, &chunk_url, offset, len, &chunk_staging),
                handle.clone(),
            );

            waiters.push(handle);
            offset += len;
        }

        for handle in waiters {
            let rc = handle.wait();

            if rc != 0 {
                return rc;
            }
        }

        0
    }

    /// Pushes `size` bytes from `staging`; returns the new etag.
    fn upload(
        &self,
        req: &mut Request,
        object: &Arc<Object>,
        size: u64,
        staging: &Arc<File>,
    ) -> Result<String, i32> {
        let chunk_size = self.upload_chunk_size();

        if chunk_size == 0 || size <= chunk_size {
            self.upload_single(req, object, size, staging)
        } else {
            self.upload_multi(req, object, size, staging)
        }
    }

    fn upload_single(
        &self,
        req: &mut Request,
        object: &Arc<Object>,
        size: u64,
        staging: &Arc<File>,
    ) -> Result<String, i32> {
        req.init(Method::Put);
        req.set_url(object.url(), None);
        object.write_request_headers(req);
        req.set_input_file(staging.clone(), 0, size);

        if let Err(e) = req.run() {
            warn!("upload of [{}] failed: {e}", object.url());
            return Err(-libc::EIO);
        }

        // a 200 is success regardless of what the body claims about
        // transferred byte counts
        if req.response_code() != HTTP_OK {
            warn!(
                "upload of [{}] returned {}",
                object.url(),
                req.response_code()
            );
            return Err(-libc::EIO);
        }

        Ok(req.response_header("etag").unwrap_or("").to_string())
    }

    /// Service-specific multipart protocol; the default falls back to a
    /// single PUT.
    fn upload_multi(
        &self,
        req: &mut Request,
        object: &Arc<Object>,
        size: u64,
        staging: &Arc<File>,
    ) -> Result<String, i32> {
        self.upload_single(req, object, size, staging)
    }
}

fn download_range(req: &mut Request, url: &str, offset: u64, len: u64, staging: &Arc<File>) -> i32 {
    req.init(Method::Get);
    req.set_url(url, None);
    req.set_header("Range", &format!("bytes={}-{}", offset, offset + len - 1));
    req.set_output_file(staging.clone(), offset);

    if let Err(e) = req.run() {
        warn!("ranged download of [{url}] at {offset} failed: {e}");
        return -libc::EIO;
    }

    if !is_success(req.response_code()) {
        debug!(
            "ranged download of [{url}] at {offset} returned {}",
            req.response_code()
        );
        return -libc::EIO;
    }

    0
}

/// The transfer used by services without protocol extensions; an upload
/// chunk size override of zero disables multipart.
pub struct DefaultFileTransfer {
    upload_chunk_size: Option<u64>,
}

impl DefaultFileTransfer {
    pub fn new() -> Self {
        Self {
            upload_chunk_size: None,
        }
    }

    pub fn without_multipart() -> Self {
        Self {
            upload_chunk_size: Some(0),
        }
    }
}

impl Default for DefaultFileTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTransfer for DefaultFileTransfer {
    fn upload_chunk_size(&self) -> u64 {
        self.upload_chunk_size
            .unwrap_or_else(|| config::get().upload_chunk_size)
    }
}
