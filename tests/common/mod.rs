//! Shared test harness: a mock remote store behind the transport seam
//! and a test service adapter that installs it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use s3fuse::Config;
use s3fuse::base::request::{
    HTTP_NO_CONTENT, HTTP_NOT_FOUND, HTTP_OK, Method, Request, RequestHook, Transport,
    TransportError,
};
use s3fuse::services::Service;
use s3fuse::services::file_transfer::{DefaultFileTransfer, FileTransfer};

pub const BUCKET_URL: &str = "/test-bucket";

/// Adapter over a closure for one-off transports.
pub struct FnTransport<F>(pub F);

impl<F> Transport for FnTransport<F>
where
    F: Fn(&mut Request) -> Result<(), TransportError> + Send + Sync,
{
    fn execute(&self, req: &mut Request) -> Result<(), TransportError> {
        (self.0)(req)
    }
}

pub struct TestService {
    transport: Arc<dyn Transport>,
    transfer: Arc<dyn FileTransfer>,
}

impl TestService {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            transfer: Arc::new(DefaultFileTransfer::new()),
        }
    }

    pub fn with_transfer(transport: Arc<dyn Transport>, transfer: Arc<dyn FileTransfer>) -> Self {
        Self {
            transport,
            transfer,
        }
    }
}

impl Service for TestService {
    fn header_prefix(&self) -> String {
        "x-test-".to_string()
    }

    fn header_meta_prefix(&self) -> String {
        "x-test-meta-".to_string()
    }

    fn bucket_url(&self) -> String {
        BUCKET_URL.to_string()
    }

    fn is_next_marker_supported(&self) -> bool {
        true
    }

    fn hook(&self) -> Option<Arc<dyn RequestHook>> {
        None
    }

    fn file_transfer(&self) -> Arc<dyn FileTransfer> {
        self.transfer.clone()
    }

    fn new_transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

/// One shared stack per test binary, for binaries whose tests can live
/// with a common mock remote and default configuration.
pub fn shared_remote() -> Arc<MockRemote> {
    static REMOTE: std::sync::OnceLock<Arc<MockRemote>> = std::sync::OnceLock::new();

    REMOTE
        .get_or_init(|| {
            let remote = MockRemote::new();
            setup(TestService::new(remote.clone()), |_| {});
            remote
        })
        .clone()
}

/// Builds the full singleton stack around `service`, in init order.
pub fn setup(service: TestService, tweak: impl FnOnce(&mut Config)) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = Config::default();
    config.bucket_name = "test-bucket".to_string();
    tweak(&mut config);

    s3fuse::base::config::init_with(config);
    s3fuse::services::init(Arc::new(service));
    s3fuse::threads::pool::init();
    s3fuse::fs::mime_types::init();
    s3fuse::fs::object_acls::init();
    s3fuse::fs::cache::init();
    s3fuse::fs::open_file_map::init();
}

#[derive(Clone)]
pub struct StoredObject {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// An in-memory bucket. HEAD/GET serve stored objects, PUT stores or
/// copies, DELETE removes; listing queries return an empty result.
pub struct MockRemote {
    objects: Mutex<HashMap<String, StoredObject>>,
    pub head_count: AtomicU32,
    pub put_count: AtomicU32,
    pub head_delay_ms: AtomicU32,
    etag_counter: AtomicU32,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            head_count: AtomicU32::new(0),
            put_count: AtomicU32::new(0),
            head_delay_ms: AtomicU32::new(0),
            etag_counter: AtomicU32::new(0),
        })
    }

    fn next_etag(&self) -> String {
        format!("\"etag-{}\"", self.etag_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Seeds an object at `url` (bucket-relative, e.g.
    /// `/test-bucket/foo`).
    pub fn insert(&self, url: &str, content_type: &str, body: &[u8], extra: &[(&str, &str)]) {
        let mut headers = vec![
            ("Content-Type".to_string(), content_type.to_string()),
            ("ETag".to_string(), self.next_etag()),
        ];

        for (name, value) in extra {
            headers.push((name.to_string(), value.to_string()));
        }

        self.objects.lock().insert(
            url.to_string(),
            StoredObject {
                headers,
                body: body.to_vec(),
            },
        );
    }

    pub fn stored(&self, url: &str) -> Option<StoredObject> {
        self.objects.lock().get(url).cloned()
    }

    fn respond_with_object(
        &self,
        req: &mut Request,
        object: &StoredObject,
        include_body: bool,
    ) -> Result<(), TransportError> {
        let content_length = object.body.len().to_string();

        let mut headers: Vec<(&str, &str)> = object
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        headers.push(("Content-Length", content_length.as_str()));

        let body = if include_body { &object.body[..] } else { &[] };

        req.simulate_response(HTTP_OK, &headers, body)
    }
}

impl Transport for MockRemote {
    fn execute(&self, req: &mut Request) -> Result<(), TransportError> {
        let (url, query) = match req.url().split_once('?') {
            Some((url, query)) => (url.to_string(), query.to_string()),
            None => (req.url().to_string(), String::new()),
        };

        match req.method() {
            Method::Head => {
                let delay = self.head_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay as u64));
                }

                self.head_count.fetch_add(1, Ordering::SeqCst);

                match self.stored(&url) {
                    Some(object) => self.respond_with_object(req, &object, false),
                    None => req.simulate_response(HTTP_NOT_FOUND, &[], b""),
                }
            }
            Method::Get => {
                if query.contains("prefix=") {
                    let listing = br#"<?xml version="1.0"?><ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>"#;
                    return req.simulate_response(HTTP_OK, &[], listing);
                }

                match self.stored(&url) {
                    Some(object) => self.respond_with_object(req, &object, true),
                    None => req.simulate_response(HTTP_NOT_FOUND, &[], b""),
                }
            }
            Method::Put => {
                self.put_count.fetch_add(1, Ordering::SeqCst);

                let etag = self.next_etag();

                // metadata travels on the request; keep it all
                let mut headers: Vec<(String, String)> = req
                    .headers()
                    .filter(|(name, _)| {
                        let name = name.to_ascii_lowercase();
                        name.starts_with("x-test-meta-") || name == "content-type"
                    })
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
                headers.push(("ETag".to_string(), etag.clone()));

                let body = if req.header("x-test-copy-source").is_some() {
                    // in-place copy: body comes from the source object
                    let source = req
                        .header("x-test-copy-source")
                        .map(str::to_string)
                        .unwrap_or_default();

                    self.stored(&source).map(|o| o.body).unwrap_or_default()
                } else {
                    req.read_body()?
                };

                self.objects
                    .lock()
                    .insert(url, StoredObject { headers, body });

                req.simulate_response(HTTP_OK, &[("ETag", etag.as_str())], b"")
            }
            Method::Delete => {
                self.objects.lock().remove(&url);
                req.simulate_response(HTTP_NO_CONTENT, &[], b"")
            }
            Method::Post => req.simulate_response(HTTP_NOT_FOUND, &[], b""),
        }
    }
}
