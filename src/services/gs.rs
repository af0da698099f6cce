//! Google Cloud Storage service adapter.
//!
//! Requests carry an OAuth 2 bearer token, refreshed from the stored
//! refresh token shortly before it expires. GCS has no S3-style
//! multipart protocol, so uploads always go out as a single PUT.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::base::config::Config;
use crate::base::request::{Request, RequestHook, TransportError};
use crate::base::{paths, timer};
use crate::services::file_transfer::{DefaultFileTransfer, FileTransfer};
use crate::services::{Service, ServiceError};

const ENDPOINT: &str = "storage.googleapis.com";
const TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";

// refresh this many seconds before the token would expire
const EXPIRY_SLACK: i64 = 60;

#[derive(Deserialize)]
struct TokenFile {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub struct GsService {
    bucket_url: String,
    hook: Arc<GsHook>,
    transfer: Arc<DefaultFileTransfer>,
}

impl GsService {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        if config.gs_token_file.is_empty() {
            return Err(ServiceError::Credentials(
                "gs_token_file is not set".to_string(),
            ));
        }

        let contents = fs::read_to_string(paths::transform(&config.gs_token_file))?;
        let credentials: TokenFile = serde_json::from_str(&contents)
            .map_err(|e| ServiceError::Credentials(format!("bad token file: {e}")))?;

        Ok(Self {
            bucket_url: format!("/{}", config.bucket_name),
            hook: Arc::new(GsHook {
                credentials,
                token: Mutex::new(None),
            }),
            transfer: Arc::new(DefaultFileTransfer::without_multipart()),
        })
    }
}

impl Service for GsService {
    fn header_prefix(&self) -> String {
        "x-goog-".to_string()
    }

    fn header_meta_prefix(&self) -> String {
        "x-goog-meta-".to_string()
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

struct BearerToken {
    access_token: String,
    expires_at: i64,
}

struct GsHook {
    credentials: TokenFile,
    token: Mutex<Option<BearerToken>>,
}

impl GsHook {
    fn current_token(&self) -> Result<String, TransportError> {
        let mut token = self.token.lock();

        let stale = match &*token {
            Some(token) => timer::current_time() >= token.expires_at - EXPIRY_SLACK,
            None => true,
        };

        if stale {
            debug!("refreshing oauth token");
            *token = Some(self.refresh()?);
        }

        Ok(token.as_ref().expect("just refreshed").access_token.clone())
    }

    fn refresh(&self) -> Result<BearerToken, TransportError> {
        let response = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()
            .post(TOKEN_URL)
            .send_form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .map_err(|e| {
                warn!("token refresh failed: {e}");
                TransportError::Auth(format!("token refresh failed: {e}"))
            })?;

        let body = response
            .into_string()
            .map_err(|e| TransportError::Auth(format!("token response unreadable: {e}")))?;

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| TransportError::Auth(format!("bad token response: {e}")))?;

        Ok(BearerToken {
            access_token: parsed.access_token,
            expires_at: timer::current_time() + parsed.expires_in,
        })
    }
}

impl RequestHook for GsHook {
    fn adjust_url(&self, url: String) -> String {
        format!("https://{ENDPOINT}{url}")
    }

    fn pre_run(&self, req: &mut Request, _iter: u32) -> Result<(), TransportError> {
        let token = self.current_token()?;

        req.set_header("Authorization", &format!("Bearer {token}"));

        Ok(())
    }
}
