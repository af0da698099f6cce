//! FVS service adapter: S3-style request signing under the `x-fvs-`
//! namespace, no multipart uploads.

use std::sync::Arc;

use crate::base::config::Config;
use crate::base::request::{Request, RequestHook, TransportError};
use crate::services::aws::{self, load_keys};
use crate::services::file_transfer::{DefaultFileTransfer, FileTransfer};
use crate::services::{Service, ServiceError};

pub struct FvsService {
    bucket_url: String,
    hook: Arc<FvsHook>,
    transfer: Arc<DefaultFileTransfer>,
}

impl FvsService {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        if config.fvs_endpoint.is_empty() {
            return Err(ServiceError::Credentials(
                "fvs_endpoint is not set".to_string(),
            ));
        }

        let (key, secret) = load_keys(&config.aws_secret_file)?;

        Ok(Self {
            bucket_url: format!("/{}", config.bucket_name),
            hook: Arc::new(FvsHook {
                key,
                secret,
                endpoint: config.fvs_endpoint.clone(),
            }),
            transfer: Arc::new(DefaultFileTransfer::without_multipart()),
        })
    }
}

impl Service for FvsService {
    fn header_prefix(&self) -> String {
        "x-fvs-".to_string()
    }

    fn header_meta_prefix(&self) -> String {
        "x-fvs-meta-".to_string()
    }

    fn bucket_url(&self) -> String {
        self.bucket_url.clone()
    }

    fn is_next_marker_supported(&self) -> bool {
        false
    }

    fn hook(&self) -> Option<Arc<dyn RequestHook>> {
        Some(self.hook.clone())
    }

    fn file_transfer(&self) -> Arc<dyn FileTransfer> {
        self.transfer.clone()
    }
}

struct FvsHook {
    key: String,
    secret: String,
    endpoint: String,
}

impl RequestHook for FvsHook {
    fn adjust_url(&self, url: String) -> String {
        format!("https://{}{}", self.endpoint, url)
    }

    fn pre_run(&self, req: &mut Request, _iter: u32) -> Result<(), TransportError> {
        aws::sign_v2(req, "FVS", &self.key, &self.secret, "x-fvs-");

        Ok(())
    }
}
