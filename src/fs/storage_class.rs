//! Storage-class and restore-status xattrs for file objects.
//!
//! Services that archive objects (Glacier and friends) report a storage
//! class and, for archived objects, restore progress. These surface as
//! read-only xattrs. The storage class is usually absent from a HEAD
//! response, so it is computed on demand with a one-key bucket listing on
//! the secondary pool.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::base::request::{self, HTTP_OK, Method, Request};
use crate::base::xml;
use crate::fs::object::Object;
use crate::fs::xattr::{Xattr, XattrMode};
use crate::services;
use crate::threads::pool::{self, RequestPool};

/// Registers the storage-class xattrs on a freshly fetched file object.
pub fn attach(obj: &Object, req: &Request) {
    if !services::get().supports_storage_class() {
        return;
    }

    let header_prefix = services::header_prefix();

    let cached: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(
        req.response_header(&format!("{header_prefix}storage-class"))
            .map(str::to_string),
    ));

    let path = obj.path().to_string();
    let get = move || -> Result<Vec<u8>, i32> {
        if let Some(class) = cached.lock().clone() {
            return Ok(class.into_bytes());
        }

        let fetched: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let fill = fetched.clone();
        let list_path = path.clone();
        let rc = pool::call(RequestPool::Secondary, move |req| {
            read_storage_class(req, &list_path, &fill)
        });

        if rc != 0 {
            return Err(rc);
        }

        let class = fetched.lock().clone().unwrap_or_else(|| "STANDARD".to_string());
        *cached.lock() = Some(class.clone());

        Ok(class.into_bytes())
    };

    obj.register_xattr(Xattr::from_callbacks(
        "storage_class",
        Arc::new(get),
        None,
        XattrMode::VISIBLE,
    ));

    if let Some(restore) = req.response_header(&format!("{header_prefix}restore")) {
        let (ongoing, expiry) = parse_restore(restore);

        obj.register_xattr(Xattr::from_bytes(
            "restore_ongoing",
            ongoing.as_bytes(),
            XattrMode::VISIBLE,
        ));
        obj.register_xattr(Xattr::from_bytes(
            "restore_expiry",
            expiry.as_bytes(),
            XattrMode::VISIBLE,
        ));
    }
}

fn read_storage_class(
    req: &mut Request,
    path: &str,
    out: &Mutex<Option<String>>,
) -> i32 {
    req.init(Method::Get);
    req.set_url(
        &services::bucket_url(),
        Some(&format!(
            "max-keys=1&prefix={}",
            request::url_encode_query(path)
        )),
    );

    if req.run().is_err() {
        return -libc::EIO;
    }

    if req.response_code() != HTTP_OK {
        return -libc::EIO;
    }

    match xml::find_first(req.response_body(), "StorageClass") {
        Ok(class) => {
            *out.lock() = class;
            0
        }
        Err(_) => -libc::EIO,
    }
}

// `ongoing-request="true", expiry-date="Sat, 1 Jan 2026 00:00:00 GMT"`;
// the date itself contains commas, so values are cut at their quotes
fn parse_restore(header: &str) -> (String, String) {
    let grab = |key: &str| -> String {
        let marker = format!("{key}=\"");

        match header.find(&marker) {
            Some(pos) => {
                let rest = &header[pos + marker.len()..];
                rest[..rest.find('"').unwrap_or(rest.len())].to_string()
            }
            None => String::new(),
        }
    };

    (grab("ongoing-request"), grab("expiry-date"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_header_parsing() {
        let (ongoing, expiry) = parse_restore(r#"ongoing-request="false", expiry-date="Fri, 23 Dec 2012 00:00:00 GMT""#);
        assert_eq!(ongoing, "false");
        assert_eq!(expiry, "Fri, 23 Dec 2012 00:00:00 GMT");

        let (ongoing, expiry) = parse_restore(r#"ongoing-request="true""#);
        assert_eq!(ongoing, "true");
        assert_eq!(expiry, "");
    }
}
