//! Directory objects.
//!
//! A directory is an empty marker object whose URL carries a trailing
//! slash. Reading one lists the bucket with the directory as prefix and
//! `/` as delimiter, yielding leaf objects (`Contents`) and
//! subdirectories (`CommonPrefixes`); the child-name list is memoized on
//! the object until it expires from the metadata cache.

use std::sync::Arc;

use log::debug;

use crate::base::request::{self, HTTP_OK, Method, Request};
use crate::base::{paths, xml};
use crate::fs::object::{Kind, Object};
use crate::fs::{cache, object};
use crate::services;
use crate::threads::pool::{self, RequestPool};

pub const CONTENT_TYPE: &str = "application/x-directory";

/// Directory URLs end in a slash; that is what distinguishes the variant.
pub fn build_url(path: &str) -> String {
    if path.is_empty() {
        format!("{}/", services::bucket_url())
    } else {
        format!("{}/", object::build_url(path))
    }
}

pub fn check(_path: &str, req: &Request) -> Option<Kind> {
    if req.url().ends_with('/') {
        Some(Kind::Directory(Default::default()))
    } else {
        None
    }
}

/// Drops the parent directory's cache entry so its next read re-lists.
pub fn invalidate_parent(path: &str) {
    cache::remove(paths::parent(path));
}

/// Child names of `obj`, fetched on first use.
pub fn read(obj: &Arc<Object>) -> Result<Arc<Vec<String>>, i32> {
    let Kind::Directory(state) = obj.kind() else {
        return Err(-libc::ENOTDIR);
    };

    if let Some(children) = state.children.lock().clone() {
        return Ok(children);
    }

    let target = obj.clone();
    let rc = pool::call(RequestPool::Primary, move |req| {
        let children = match list_children(req, target.path()) {
            Ok(children) => children,
            Err(rc) => return rc,
        };

        if let Kind::Directory(state) = target.kind() {
            *state.children.lock() = Some(Arc::new(children));
        }

        0
    });

    if rc != 0 {
        return Err(rc);
    }

    Ok(state.children.lock().clone().unwrap_or_default())
}

/// True if the directory has no children besides its own marker.
pub fn is_empty(obj: &Arc<Object>) -> Result<bool, i32> {
    let path = obj.path().to_string();

    let rc = pool::call(RequestPool::Primary, move |req| {
        match check_empty(req, &path) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(rc) => rc,
        }
    });

    match rc {
        0 => Ok(false),
        1 => Ok(true),
        rc => Err(rc),
    }
}

fn list_query(prefix: &str, delimiter: bool, marker: &str, max_keys: Option<u32>) -> String {
    let mut query = String::new();

    if delimiter {
        query.push_str("delimiter=%2F&");
    }

    if let Some(max_keys) = max_keys {
        query.push_str(&format!("max-keys={max_keys}&"));
    }

    query.push_str(&format!("marker={}", request::url_encode_query(marker)));
    query.push_str(&format!("&prefix={}", request::url_encode_query(prefix)));

    query
}

fn run_list(req: &mut Request, query: &str) -> Result<(), i32> {
    req.init(Method::Get);
    req.set_url(&services::bucket_url(), Some(query));

    if req.run().is_err() {
        return Err(-libc::EIO);
    }

    if req.response_code() != HTTP_OK {
        debug!("list returned {}", req.response_code());
        return Err(-libc::EIO);
    }

    Ok(())
}

fn list_children(req: &mut Request, path: &str) -> Result<Vec<String>, i32> {
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };

    let next_marker_supported = services::get().is_next_marker_supported();
    let mut children = Vec::new();
    let mut marker = String::new();

    loop {
        run_list(req, &list_query(&prefix, true, &marker, None))?;

        let body = req.response_body().to_vec();

        let keys = xml::find_all(&body, "Key").map_err(|_| -libc::EIO)?;
        let subdirs = xml::find_all(&body, "CommonPrefixes").map_err(|_| -libc::EIO)?;
        let truncated = xml::find_first(&body, "IsTruncated")
            .map_err(|_| -libc::EIO)?
            .is_some_and(|v| v == "true");

        let last_key = keys.last().cloned();

        for key in keys {
            // the directory's own marker lists under its prefix
            if let Some(name) = key.strip_prefix(&prefix) {
                if !name.is_empty() {
                    children.push(name.to_string());
                }
            }
        }

        for subdir in subdirs {
            if let Some(name) = subdir.strip_prefix(&prefix) {
                let name = name.trim_end_matches('/');
                if !name.is_empty() {
                    children.push(name.to_string());
                }
            }
        }

        if !truncated {
            break;
        }

        marker = if next_marker_supported {
            match xml::find_first(&body, "NextMarker").map_err(|_| -libc::EIO)? {
                Some(next) => next,
                None => last_key.unwrap_or_default(),
            }
        } else {
            last_key.unwrap_or_default()
        };

        if marker.is_empty() {
            break;
        }
    }

    Ok(children)
}

fn check_empty(req: &mut Request, path: &str) -> Result<bool, i32> {
    let prefix = format!("{path}/");

    run_list(req, &list_query(&prefix, false, "", Some(2)))?;

    let keys = xml::find_all(req.response_body(), "Key").map_err(|_| -libc::EIO)?;

    Ok(keys.iter().all(|key| *key == prefix))
}

/// Every raw key below `prefix/`, markers included; used by rename.
fn list_all_keys(req: &mut Request, path: &str) -> Result<Vec<String>, i32> {
    let prefix = format!("{path}/");
    let mut keys = Vec::new();
    let mut marker = String::new();

    loop {
        run_list(req, &list_query(&prefix, false, &marker, None))?;

        let body = req.response_body().to_vec();
        let page = xml::find_all(&body, "Key").map_err(|_| -libc::EIO)?;
        let truncated = xml::find_first(&body, "IsTruncated")
            .map_err(|_| -libc::EIO)?
            .is_some_and(|v| v == "true");

        let last = page.last().cloned();
        keys.extend(page);

        if !truncated {
            break;
        }

        match last {
            Some(last) => marker = last,
            None => break,
        }
    }

    Ok(keys)
}

/// Moves every object under `from/` to the same suffix under `to/`.
pub fn rename_children(req: &mut Request, from: &str, to: &str) -> i32 {
    let keys = match list_all_keys(req, from) {
        Ok(keys) => keys,
        Err(rc) => return rc,
    };

    let from_prefix = format!("{from}/");

    for key in keys {
        let Some(suffix) = key.strip_prefix(&from_prefix) else {
            continue;
        };

        let old_url = format!("{}/{}", services::bucket_url(), request::url_encode(&key));
        let new_url = format!(
            "{}/{}",
            services::bucket_url(),
            request::url_encode(&format!("{to}/{suffix}"))
        );

        let rc = object::copy_by_url(req, &old_url, &new_url);
        if rc != 0 {
            return rc;
        }

        cache::remove(key.trim_end_matches('/'));

        let rc = object::remove_by_url(req, &old_url);
        if rc != 0 {
            return rc;
        }
    }

    0
}
