//! Amazon S3 (and compatible) service adapter: request signing and the
//! multipart upload protocol.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::SystemTime;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::base::config::Config;
use crate::base::request::{
    self, HTTP_NO_CONTENT, HTTP_OK, Method, Request, RequestHook, TransportError,
};
use crate::base::{paths, timer, xml};
use crate::fs::object::Object;
use crate::services::file_transfer::FileTransfer;
use crate::services::{Service, ServiceError};
use crate::threads::async_handle::WaitHandle;
use crate::threads::pool::{self, RequestPool};

pub struct AwsService {
    bucket_url: String,
    hook: Arc<AwsHook>,
    transfer: Arc<AwsFileTransfer>,
    storage_class: bool,
}

impl AwsService {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let (key, secret) = load_keys(&config.aws_secret_file)?;

        let version = match config.aws_signature_version {
            1 | 2 => {
                if config.aws_signature_version == 1 {
                    warn!("signature version 1 is obsolete; signing with version 2");
                }
                SignatureVersion::V2
            }
            4 => SignatureVersion::V4,
            other => {
                return Err(ServiceError::Credentials(format!(
                    "unsupported aws_signature_version {other}"
                )));
            }
        };

        Ok(Self {
            bucket_url: format!("/{}", config.bucket_name),
            hook: Arc::new(AwsHook {
                key,
                secret,
                region: config.aws_region.clone(),
                endpoint: config.aws_endpoint.clone(),
                scheme: if config.aws_use_ssl { "https" } else { "http" },
                version,
            }),
            transfer: Arc::new(AwsFileTransfer),
            storage_class: config.allow_glacier_restores,
        })
    }
}

impl Service for AwsService {
    fn header_prefix(&self) -> String {
        "x-amz-".to_string()
    }

    fn header_meta_prefix(&self) -> String {
        "x-amz-meta-".to_string()
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

    fn supports_storage_class(&self) -> bool {
        self.storage_class
    }
}

/// `<key-id> <secret>` on the first non-comment line.
pub(crate) fn load_keys(file: &str) -> Result<(String, String), ServiceError> {
    if file.is_empty() {
        return Err(ServiceError::Credentials(
            "aws_secret_file is not set".to_string(),
        ));
    }

    let reader = BufReader::new(File::open(paths::transform(file))?);

    for line in reader.lines() {
        let line = line?;

        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();

        if let (Some(key), Some(secret)) = (fields.next(), fields.next()) {
            return Ok((key.to_string(), secret.to_string()));
        }
    }

    Err(ServiceError::Credentials(format!(
        "no credentials found in [{file}]"
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureVersion {
    V2,
    V4,
}

struct AwsHook {
    key: String,
    secret: String,
    region: String,
    endpoint: String,
    scheme: &'static str,
    version: SignatureVersion,
}

impl RequestHook for AwsHook {
    fn adjust_url(&self, url: String) -> String {
        format!("{}://{}{}", self.scheme, self.endpoint, url)
    }

    fn pre_run(&self, req: &mut Request, _iter: u32) -> Result<(), TransportError> {
        match self.version {
            SignatureVersion::V2 => {
                sign_v2(req, "AWS", &self.key, &self.secret, "x-amz-");
                Ok(())
            }
            SignatureVersion::V4 => {
                sign_v4(req, &self.key, &self.secret, &self.region, &self.endpoint);
                Ok(())
            }
        }
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// "https://host/path?query" -> ("/path", "query")
fn split_url(url: &str) -> (&str, &str) {
    let after_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };

    let path_and_query = match after_scheme.find('/') {
        Some(pos) => &after_scheme[pos..],
        None => "/",
    };

    match path_and_query.split_once('?') {
        Some((path, query)) => (path, query),
        None => (path_and_query, ""),
    }
}

// subresources that participate in the v2 canonical resource
const V2_SUBRESOURCES: &[&str] = &[
    "acl",
    "delete",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "requestPayment",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

fn v2_canonical_resource(url: &str) -> String {
    let (path, query) = split_url(url);

    let mut subresources: Vec<&str> = query
        .split('&')
        .filter(|param| {
            let name = param.split('=').next().unwrap_or("");
            V2_SUBRESOURCES.contains(&name)
        })
        .collect();

    subresources.sort_unstable();

    if subresources.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", subresources.join("&"))
    }
}

/// Signature version 2; shared by the S3-compatible services, which
/// differ only in the scheme label and header namespace.
pub(crate) fn sign_v2(
    req: &mut Request,
    auth_label: &str,
    key: &str,
    secret: &str,
    header_prefix: &str,
) {
    let date = httpdate::fmt_http_date(SystemTime::now());
    req.set_header("Date", &date);

    let mut canonical_headers = BTreeMap::new();

    for (name, value) in req.headers() {
        let name = name.to_ascii_lowercase();

        if name.starts_with(header_prefix) {
            canonical_headers.insert(name, value.trim().to_string());
        }
    }

    let mut string_to_sign = format!(
        "{}\n{}\n{}\n{}\n",
        req.method().as_str(),
        req.header("Content-MD5").unwrap_or(""),
        req.header("Content-Type").unwrap_or(""),
        date
    );

    for (name, value) in &canonical_headers {
        string_to_sign.push_str(&format!("{name}:{value}\n"));
    }

    string_to_sign.push_str(&v2_canonical_resource(req.url()));

    let signature = BASE64.encode(hmac_sha1(secret.as_bytes(), string_to_sign.as_bytes()));

    req.set_header("Authorization", &format!("{auth_label} {key}:{signature}"));
}

fn sign_v4(req: &mut Request, key: &str, secret: &str, region: &str, endpoint: &str) {
    let now = timer::current_time();
    let date = amz_date(now);
    let datetime = amz_datetime(now);

    req.set_header("Host", endpoint);
    req.set_header("x-amz-date", &datetime);
    // bodies stream from the staging file; hash them as unsigned
    req.set_header("x-amz-content-sha256", "UNSIGNED-PAYLOAD");

    let (path, query) = {
        let (path, query) = split_url(req.url());
        (path.to_string(), query.to_string())
    };

    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect();
    params.sort();

    let canonical_query = params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    headers.insert("host".to_string(), endpoint.to_string());

    for (name, value) in req.headers() {
        let name = name.to_ascii_lowercase();

        if name.starts_with("x-amz-") {
            headers.insert(name, value.trim().to_string());
        }
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\nUNSIGNED-PAYLOAD",
        req.method().as_str(),
        path,
        canonical_query,
        canonical_headers,
        signed_headers
    );

    let scope = format!("{date}/{region}/s3/aws4_request");

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{datetime}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");

    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    req.set_header(
        "Authorization",
        &format!(
            "AWS4-HMAC-SHA256 Credential={key}/{scope},SignedHeaders={signed_headers},Signature={signature}"
        ),
    );
}

// civil-from-days; good for the range of dates a clock can produce
fn utc_parts(epoch: i64) -> (i64, u64, u64, u64, u64, u64) {
    let days = epoch.div_euclid(86_400);
    let secs_of_day = epoch.rem_euclid(86_400) as u64;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u64;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u64;
    let year = if month <= 2 { year + 1 } else { year };

    (
        year,
        month,
        day,
        secs_of_day / 3600,
        (secs_of_day / 60) % 60,
        secs_of_day % 60,
    )
}

fn amz_date(epoch: i64) -> String {
    let (year, month, day, _, _, _) = utc_parts(epoch);
    format!("{year:04}{month:02}{day:02}")
}

fn amz_datetime(epoch: i64) -> String {
    let (year, month, day, hour, minute, second) = utc_parts(epoch);
    format!("{year:04}{month:02}{day:02}T{hour:02}{minute:02}{second:02}Z")
}

/// S3 multipart upload: numbered parts on the secondary pool, a
/// completion request carrying the ordered part etags, and an abort on
/// irrecoverable failure.
pub struct AwsFileTransfer;

impl FileTransfer for AwsFileTransfer {
    fn upload_multi(
        &self,
        req: &mut Request,
        object: &Arc<Object>,
        size: u64,
        staging: &Arc<std::fs::File>,
    ) -> Result<String, i32> {
        let upload_id = multi_init(req, object)?;

        let chunk_size = self.upload_chunk_size();
        let part_count = size.div_ceil(chunk_size) as usize;

        let etags: Arc<parking_lot::Mutex<Vec<Option<String>>>> =
            Arc::new(parking_lot::Mutex::new(vec![None; part_count]));

        let mut waiters = Vec::with_capacity(part_count);

        for index in 0..part_count {
            let offset = index as u64 * chunk_size;
            let len = chunk_size.min(size - offset);

            let part_url = object.url().to_string();
            let part_upload_id = upload_id.clone();
            let part_staging = staging.clone();
            let part_etags = etags.clone();
            let handle = Arc::new(WaitHandle::new());

            pool::post(
                RequestPool::Secondary,
                move |req| {
                    upload_part(
                        req,
                        &part_url,
                        &part_upload_id,
                        index,
                        offset,
                        len,
                        &part_staging,
                        &part_etags,
                    )
                },
                handle.clone(),
            );

            waiters.push(handle);
        }

        let mut failed = false;
        for handle in waiters {
            if handle.wait() != 0 {
                failed = true;
            }
        }

        if failed {
            multi_cancel(req, object.url(), &upload_id);
            return Err(-libc::EIO);
        }

        let parts = etags.lock().clone();
        multi_complete(req, object.url(), &upload_id, &parts)
    }
}

fn multi_init(req: &mut Request, object: &Arc<Object>) -> Result<String, i32> {
    req.init(Method::Post);
    req.set_url(object.url(), Some("uploads"));
    object.write_request_headers(req);

    if let Err(e) = req.run() {
        warn!("multipart init for [{}] failed: {e}", object.url());
        return Err(-libc::EIO);
    }

    if req.response_code() != HTTP_OK {
        warn!(
            "multipart init for [{}] returned {}",
            object.url(),
            req.response_code()
        );
        return Err(-libc::EIO);
    }

    match xml::find_first(req.response_body(), "UploadId") {
        Ok(Some(upload_id)) if !upload_id.is_empty() => Ok(upload_id),
        _ => Err(-libc::EIO),
    }
}

#[allow(clippy::too_many_arguments)]
fn upload_part(
    req: &mut Request,
    url: &str,
    upload_id: &str,
    index: usize,
    offset: u64,
    len: u64,
    staging: &Arc<std::fs::File>,
    etags: &parking_lot::Mutex<Vec<Option<String>>>,
) -> i32 {
    let part_number = index + 1;

    // one retry per part before the whole upload is abandoned
    for attempt in 0..2 {
        req.init(Method::Put);
        req.set_url(
            url,
            Some(&format!(
                "partNumber={part_number}&uploadId={}",
                request::url_encode_query(upload_id)
            )),
        );
        req.set_input_file(staging.clone(), offset, len);

        let outcome = req.run();

        if outcome.is_ok() && req.response_code() == HTTP_OK {
            if let Some(etag) = req.response_header("etag") {
                etags.lock()[index] = Some(etag.to_string());
                return 0;
            }
        }

        if attempt == 0 {
            warn!("part {part_number} of [{url}] failed, retrying");
        }
    }

    -libc::EIO
}

fn multi_complete(
    req: &mut Request,
    url: &str,
    upload_id: &str,
    parts: &[Option<String>],
) -> Result<String, i32> {
    let mut body = String::from("<CompleteMultipartUpload>");

    for (index, etag) in parts.iter().enumerate() {
        let Some(etag) = etag else {
            return Err(-libc::EIO);
        };

        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{etag}</ETag></Part>",
            index + 1
        ));
    }

    body.push_str("</CompleteMultipartUpload>");

    req.init(Method::Post);
    req.set_url(
        url,
        Some(&format!(
            "uploadId={}",
            request::url_encode_query(upload_id)
        )),
    );
    req.set_header("Content-Type", "application/xml");
    req.set_input_bytes(body.into_bytes());

    if let Err(e) = req.run() {
        warn!("multipart completion for [{url}] failed: {e}");
        return Err(-libc::EIO);
    }

    if req.response_code() != HTTP_OK {
        warn!(
            "multipart completion for [{url}] returned {}",
            req.response_code()
        );
        return Err(-libc::EIO);
    }

    // a 200 can still carry an error document; the etag is the proof
    match xml::find_first(req.response_body(), "ETag") {
        Ok(Some(etag)) if !etag.is_empty() => Ok(etag),
        _ => Err(-libc::EIO),
    }
}

fn multi_cancel(req: &mut Request, url: &str, upload_id: &str) {
    req.init(Method::Delete);
    req.set_url(
        url,
        Some(&format!(
            "uploadId={}",
            request::url_encode_query(upload_id)
        )),
    );

    match req.run() {
        Ok(()) if req.response_code() == HTTP_NO_CONTENT => {}
        Ok(()) => debug!(
            "multipart abort for [{url}] returned {}",
            req.response_code()
        ),
        Err(e) => warn!("multipart abort for [{url}] failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_breakdown() {
        // 2015-10-21T07:28:00Z
        assert_eq!(amz_datetime(1445412480), "20151021T072800Z");
        assert_eq!(amz_date(1445412480), "20151021");

        // epoch
        assert_eq!(amz_datetime(0), "19700101T000000Z");

        // leap day
        assert_eq!(amz_date(1709164800), "20240229");
    }

    #[test]
    fn v2_canonical_resource_subresources() {
        assert_eq!(v2_canonical_resource("https://host/bucket/key"), "/bucket/key");
        assert_eq!(
            v2_canonical_resource("https://host/bucket/key?uploads"),
            "/bucket/key?uploads"
        );
        assert_eq!(
            v2_canonical_resource("https://host/bucket/key?uploadId=abc&partNumber=2"),
            "/bucket/key?partNumber=2&uploadId=abc"
        );
        assert_eq!(
            v2_canonical_resource("https://host/bucket?marker=a&prefix=b"),
            "/bucket"
        );
    }

    #[test]
    fn url_splitting() {
        assert_eq!(split_url("https://host/a/b?c=d"), ("/a/b", "c=d"));
        assert_eq!(split_url("https://host"), ("/", ""));
        assert_eq!(split_url("/bucket/key"), ("/bucket/key", ""));
    }
}
