//! Service adapters.
//!
//! A service supplies the header prefixes, the bucket URL, the signing
//! hook, and the file-transfer specialization for one storage provider.
//! Exactly one service is active per process.

pub mod aws;
pub mod file_transfer;
pub mod fvs;
pub mod gs;
pub mod iijgio;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

use crate::base::config::{self, Config};
use crate::base::request::{RequestHook, Transport, UreqTransport};
use crate::services::file_transfer::FileTransfer;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("bad credentials: {0}")]
    Credentials(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub trait Service: Send + Sync {
    /// Header namespace, e.g. `x-amz-`.
    fn header_prefix(&self) -> String;

    /// Metadata header namespace, e.g. `x-amz-meta-`.
    fn header_meta_prefix(&self) -> String;

    /// Bucket URL path, e.g. `/my-bucket`; the hook's `adjust_url` turns
    /// this into a full URL.
    fn bucket_url(&self) -> String;

    /// Whether list responses carry `NextMarker` when truncated.
    fn is_next_marker_supported(&self) -> bool;

    fn hook(&self) -> Option<Arc<dyn RequestHook>>;

    fn file_transfer(&self) -> Arc<dyn FileTransfer>;

    /// One long-lived client per request worker.
    fn new_transport(&self) -> Arc<dyn Transport> {
        Arc::new(UreqTransport::new(Duration::from_secs(
            config::get().request_timeout_in_s,
        )))
    }

    /// Whether objects report a storage class (archive tiers).
    fn supports_storage_class(&self) -> bool {
        false
    }
}

static SERVICE: RwLock<Option<Arc<dyn Service>>> = RwLock::new(None);

/// Builds the adapter named by `config.service`.
pub fn create(config: &Config) -> Result<Arc<dyn Service>, ServiceError> {
    match config.service.as_str() {
        "aws" => Ok(Arc::new(aws::AwsService::new(config)?)),
        "google-storage" => Ok(Arc::new(gs::GsService::new(config)?)),
        "fvs" => Ok(Arc::new(fvs::FvsService::new(config)?)),
        "iijgio" => Ok(Arc::new(iijgio::IijgioService::new(config)?)),
        other => Err(ServiceError::UnknownService(other.to_string())),
    }
}

pub fn init(service: Arc<dyn Service>) {
    *SERVICE.write() = Some(service);
}

pub fn terminate() {
    *SERVICE.write() = None;
}

pub fn get() -> Arc<dyn Service> {
    SERVICE.read().clone().expect("service not initialized")
}

pub fn header_prefix() -> String {
    get().header_prefix()
}

pub fn header_meta_prefix() -> String {
    get().header_meta_prefix()
}

pub fn bucket_url() -> String {
    get().bucket_url()
}
