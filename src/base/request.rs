//! The HTTP request object handed to pool workers.
//!
//! A `Request` is reused for many runs by the worker that owns it. The
//! actual wire I/O happens behind the [`Transport`] trait so the rest of
//! the crate (and the tests) never talk to the network directly; the
//! production transport wraps a long-lived [`ureq::Agent`]. A
//! service-specific [`RequestHook`] gets a chance to rewrite the URL and
//! add signing headers before each run.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;

pub const HTTP_OK: u16 = 200;
pub const HTTP_CREATED: u16 = 201;
pub const HTTP_NO_CONTENT: u16 = 204;
pub const HTTP_PARTIAL_CONTENT: u16 = 206;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_PRECONDITION_FAILED: u16 = 412;

/// Response codes that do not fail the request outright.
pub fn is_success(code: u16) -> bool {
    matches!(
        code,
        HTTP_OK | HTTP_CREATED | HTTP_NO_CONTENT | HTTP_PARTIAL_CONTENT
    )
}

// everything except unreserved characters and the path separator
const URL_UNSAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

pub fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, URL_UNSAFE).to_string()
}

// query values additionally encode the path separator
const QUERY_UNSAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn url_encode_query(s: &str) -> String {
    utf8_percent_encode(s, QUERY_UNSAFE).to_string()
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level failure; worth retrying.
    #[error("transport: {0}")]
    Network(String),
    #[error("local I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Signing or credential failure; retrying will not help.
    #[error("auth: {0}")]
    Auth(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Delete,
    Get,
    Head,
    Post,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

/// Request body source. File regions are read with `pread` so a body can
/// be re-sent on retry and several workers can share one staging file.
#[derive(Clone)]
pub enum Body {
    None,
    Bytes(Vec<u8>),
    FileRegion {
        file: Arc<File>,
        offset: u64,
        len: u64,
    },
}

/// Where the response body goes.
#[derive(Clone)]
enum Target {
    Buffer,
    FileRegion { file: Arc<File>, offset: u64 },
}

/// Wall-clock timer for the current run, shared with the pool watchdog.
/// A zero start marks the timer idle.
#[derive(Debug, Default)]
pub struct RunTimer {
    started_at_us: AtomicU64,
}

impl RunTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);

        self.started_at_us.store(now.max(1), Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.started_at_us.store(0, Ordering::SeqCst);
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        let started = self.started_at_us.load(Ordering::SeqCst);

        if started == 0 {
            return false;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        now.saturating_sub(started) > timeout.as_micros() as u64
    }
}

/// Signs and otherwise adjusts outgoing requests; one per service.
pub trait RequestHook: Send + Sync {
    fn adjust_url(&self, url: String) -> String {
        url
    }

    fn pre_run(&self, req: &mut Request, iter: u32) -> Result<(), TransportError>;
}

/// Executes a prepared [`Request`], filling in its response fields.
pub trait Transport: Send + Sync {
    fn execute(&self, req: &mut Request) -> Result<(), TransportError>;
}

const TRANSIENT_RETRIES: u32 = 3;

pub struct Request {
    transport: Arc<dyn Transport>,
    hook: Option<Arc<dyn RequestHook>>,
    timer: Arc<RunTimer>,

    method: Method,
    url: String,
    headers: BTreeMap<String, String>,
    body: Body,
    target: Target,

    response_code: u16,
    response_headers: BTreeMap<String, String>,
    response_body: Vec<u8>,
    last_modified: i64,
}

impl Request {
    /// Builds a request bound to the active service's transport and hook.
    pub fn new() -> Self {
        let service = crate::services::get();

        Self::with_transport(service.new_transport(), service.hook())
    }

    /// Like [`Request::new`], but sharing the caller's run timer so a
    /// watchdog can observe this request's wall-clock time.
    pub fn new_with_timer(timer: Arc<RunTimer>) -> Self {
        let mut request = Self::new();
        request.timer = timer;
        request
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        hook: Option<Arc<dyn RequestHook>>,
    ) -> Self {
        Self {
            transport,
            hook,
            timer: Arc::new(RunTimer::new()),
            method: Method::Get,
            url: String::new(),
            headers: BTreeMap::new(),
            body: Body::None,
            target: Target::Buffer,
            response_code: 0,
            response_headers: BTreeMap::new(),
            response_body: Vec::new(),
            last_modified: 0,
        }
    }

    pub fn run_timer(&self) -> Arc<RunTimer> {
        self.timer.clone()
    }

    /// Resets the request for a fresh run; response state from the
    /// previous run is discarded.
    pub fn init(&mut self, method: Method) {
        self.method = method;
        self.url.clear();
        self.headers.clear();
        self.body = Body::None;
        self.target = Target::Buffer;
        self.response_code = 0;
        self.response_headers.clear();
        self.response_body.clear();
        self.last_modified = 0;
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_url(&mut self, url: &str, query: Option<&str>) {
        let mut full = url.to_string();

        if let Some(query) = query {
            full.push('?');
            full.push_str(query);
        }

        if let Some(hook) = self.hook.clone() {
            full = hook.adjust_url(full);
        }

        self.url = full;
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_input_bytes(&mut self, bytes: Vec<u8>) {
        self.body = Body::Bytes(bytes);
    }

    pub fn set_input_file(&mut self, file: Arc<File>, offset: u64, len: u64) {
        self.body = Body::FileRegion { file, offset, len };
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_len(&self) -> u64 {
        match &self.body {
            Body::None => 0,
            Body::Bytes(b) => b.len() as u64,
            Body::FileRegion { len, .. } => *len,
        }
    }

    /// Materializes the body; transports and tests that need the bytes in
    /// one piece use this.
    pub fn read_body(&self) -> std::io::Result<Vec<u8>> {
        match &self.body {
            Body::None => Ok(Vec::new()),
            Body::Bytes(b) => Ok(b.clone()),
            Body::FileRegion { file, offset, len } => {
                let mut reader = FileRegionReader::new(file.clone(), *offset, *len);
                let mut out = Vec::with_capacity(*len as usize);
                reader.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Directs the response body into `file` at `offset` instead of the
    /// in-memory buffer.
    pub fn set_output_file(&mut self, file: Arc<File>, offset: u64) {
        self.target = Target::FileRegion { file, offset };
    }

    pub fn response_code(&self) -> u16 {
        self.response_code
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn response_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.response_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    /// `Last-Modified` of the response, as epoch seconds; zero if absent.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Records the response line and headers; the body follows through
    /// [`Request::consume_body`]. Transports (and mocks) call this.
    pub fn begin_response(&mut self, code: u16, headers: &[(&str, &str)]) {
        self.response_code = code;
        self.response_headers.clear();
        self.response_body.clear();
        self.last_modified = 0;

        for (name, value) in headers {
            self.response_headers
                .insert(name.to_ascii_lowercase(), value.to_string());
        }

        if let Some(lm) = self.response_headers.get("last-modified") {
            if let Ok(when) = httpdate::parse_http_date(lm) {
                self.last_modified = when
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
            }
        }
    }

    /// Streams the response body to its destination. Error responses
    /// always land in the buffer, never in a caller's staging file.
    pub fn consume_body(&mut self, mut reader: impl Read) -> Result<(), TransportError> {
        let target = if is_success(self.response_code) {
            self.target.clone()
        } else {
            Target::Buffer
        };

        match target {
            Target::Buffer => {
                reader.read_to_end(&mut self.response_body)?;
            }
            Target::FileRegion { file, offset } => {
                let mut chunk = vec![0u8; 64 * 1024];
                let mut at = offset;

                loop {
                    let n = reader.read(&mut chunk)?;

                    if n == 0 {
                        break;
                    }

                    let mut written = 0;
                    while written < n {
                        written += nix::sys::uio::pwrite(
                            &*file,
                            &chunk[written..n],
                            (at + written as u64) as i64,
                        )
                        .map_err(std::io::Error::from)?;
                    }

                    at += n as u64;
                }
            }
        }

        Ok(())
    }

    /// Convenience for mock transports: response line, headers, and body
    /// in one call.
    pub fn simulate_response(
        &mut self,
        code: u16,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<(), TransportError> {
        self.begin_response(code, headers);
        self.consume_body(body)
    }

    /// Runs the request. Network-level failures and 5xx responses are
    /// retried a few times before being surfaced; the final response code
    /// is still the caller's to check.
    pub fn run(&mut self) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let mut last_error = None;

        for iter in 0..TRANSIENT_RETRIES {
            if let Some(hook) = self.hook.clone() {
                hook.pre_run(self, iter)?;
            }

            match transport.execute(self) {
                Ok(()) => {
                    if self.response_code >= 500 && iter + 1 < TRANSIENT_RETRIES {
                        warn!(
                            "{} [{}] returned {}, retrying",
                            self.method.as_str(),
                            self.url,
                            self.response_code
                        );
                        continue;
                    }

                    return Ok(());
                }
                Err(e) if e.is_transient() && iter + 1 < TRANSIENT_RETRIES => {
                    warn!("{} [{}] failed: {}, retrying", self.method.as_str(), self.url, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `Read` over a byte range of a file, using `pread` so concurrent
/// readers never disturb each other's cursor.
pub struct FileRegionReader {
    file: Arc<File>,
    offset: u64,
    remaining: u64,
}

impl FileRegionReader {
    pub fn new(file: Arc<File>, offset: u64, len: u64) -> Self {
        Self {
            file,
            offset,
            remaining: len,
        }
    }
}

impl Read for FileRegionReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let want = buf.len().min(self.remaining as usize);
        let n = nix::sys::uio::pread(&*self.file, &mut buf[..want], self.offset as i64)?;

        self.offset += n as u64;
        self.remaining -= n as u64;

        Ok(n)
    }
}

/// Production transport: one long-lived agent per request worker, with
/// connection reuse and an overall per-call timeout as a backstop behind
/// the pool watchdog.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Transport for UreqTransport {
    fn execute(&self, req: &mut Request) -> Result<(), TransportError> {
        let mut call = self.agent.request(req.method().as_str(), req.url());

        for (name, value) in req.headers() {
            call = call.set(name, value);
        }

        let body = req.body().clone();

        let result = match &body {
            Body::None => call.call(),
            Body::Bytes(bytes) => {
                call = call.set("Content-Length", &bytes.len().to_string());
                call.send_bytes(bytes)
            }
            Body::FileRegion { file, offset, len } => {
                call = call.set("Content-Length", &len.to_string());
                call.send(FileRegionReader::new(file.clone(), *offset, *len))
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(e)) => {
                return Err(TransportError::Network(e.to_string()));
            }
        };

        let code = response.status();
        let names = response.headers_names();
        let headers: Vec<(&str, &str)> = names
            .iter()
            .filter_map(|name| response.header(name).map(|v| (name.as_str(), v)))
            .collect();

        req.begin_response(code, &headers);
        req.consume_body(response.into_reader())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encoding_keeps_slashes() {
        assert_eq!(url_encode("a/b c+d"), "a/b%20c%2Bd");
        assert_eq!(url_encode("plain-key_1.txt~"), "plain-key_1.txt~");
    }

    #[test]
    fn success_codes() {
        for code in [200, 201, 204, 206] {
            assert!(is_success(code));
        }
        for code in [301, 403, 404, 500] {
            assert!(!is_success(code));
        }
    }

    #[test]
    fn run_timer_expiry() {
        let timer = RunTimer::new();
        assert!(!timer.is_expired(Duration::ZERO));

        timer.start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.is_expired(Duration::from_millis(1)));
        assert!(!timer.is_expired(Duration::from_secs(60)));

        timer.stop();
        assert!(!timer.is_expired(Duration::ZERO));
    }

    struct StaticTransport;

    impl Transport for StaticTransport {
        fn execute(&self, req: &mut Request) -> Result<(), TransportError> {
            req.simulate_response(
                HTTP_OK,
                &[("ETag", "\"abc\""), ("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")],
                b"hello",
            )
        }
    }

    #[test]
    fn response_capture() {
        let mut req = Request::with_transport(Arc::new(StaticTransport), None);

        req.init(Method::Get);
        req.set_url("http://remote/bucket/key", None);
        req.run().unwrap();

        assert_eq!(req.response_code(), HTTP_OK);
        assert_eq!(req.response_header("etag"), Some("\"abc\""));
        assert_eq!(req.response_header("ETag"), Some("\"abc\""));
        assert_eq!(req.response_body(), b"hello");
        assert_eq!(req.last_modified(), 1445412480);
    }

    struct FlakyTransport {
        failures: std::sync::atomic::AtomicU32,
    }

    impl Transport for FlakyTransport {
        fn execute(&self, req: &mut Request) -> Result<(), TransportError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 1 {
                req.simulate_response(503, &[], b"slow down")
            } else {
                req.simulate_response(HTTP_OK, &[], b"")
            }
        }
    }

    #[test]
    fn transient_5xx_is_retried() {
        let mut req = Request::with_transport(
            Arc::new(FlakyTransport {
                failures: std::sync::atomic::AtomicU32::new(2),
            }),
            None,
        );

        req.init(Method::Put);
        req.set_url("http://remote/bucket/key", None);
        req.run().unwrap();

        assert_eq!(req.response_code(), HTTP_OK);
    }
}
