//! IIJ GIO storage service adapter: an S3-compatible API under the
//! `x-iijgio-` namespace, multipart uploads included.

use std::sync::Arc;

use crate::base::config::Config;
use crate::base::request::{Request, RequestHook, TransportError};
use crate::services::aws::{self, AwsFileTransfer, load_keys};
use crate::services::file_transfer::FileTransfer;
use crate::services::{Service, ServiceError};

pub struct IijgioService {
    bucket_url: String,
    hook: Arc<IijgioHook>,
    transfer: Arc<AwsFileTransfer>,
}

impl IijgioService {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let (key, secret) = load_keys(&config.aws_secret_file)?;

        Ok(Self {
            bucket_url: format!("/{}", config.bucket_name),
            hook: Arc::new(IijgioHook {
                key,
                secret,
                endpoint: config.iijgio_endpoint.clone(),
            }),
            transfer: Arc::new(AwsFileTransfer),
        })
    }
}

impl Service for IijgioService {
    fn header_prefix(&self) -> String {
        "x-iijgio-".to_string()
    }

    fn header_meta_prefix(&self) -> String {
        "x-iijgio-meta-".to_string()
    }

    fn bucket_url(&self) -> String {
        self.bucket_url.clone()
    }

    fn is_next_marker_supported(&self) -> bool {
        true
    }

    fn hook(&self) -> Option<Arc<dyn RequestHook>> {
        Some(self.hook.clone())
    }

    fn file_transfer(&self) -> Arc<dyn FileTransfer> {
        self.transfer.clone()
    }
}

struct IijgioHook {
    key: String,
    secret: String,
    endpoint: String,
}

impl RequestHook for IijgioHook {
    fn adjust_url(&self, url: String) -> String {
        format!("https://{}{}", self.endpoint, url)
    }

    fn pre_run(&self, req: &mut Request, _iter: u32) -> Result<(), TransportError> {
        aws::sign_v2(req, "IIJGIO", &self.key, &self.secret, "x-iijgio-");

        Ok(())
    }
}
