//! Symbolic link objects.
//!
//! A symlink is stored as a tiny object with content type
//! `text/symlink` whose body is the literal prefix `SYMLINK:` followed
//! by the target path.

use std::sync::Arc;

use log::{debug, warn};

use crate::base::request::{HTTP_OK, Method, Request};
use crate::fs::object::{Kind, Object};
use crate::threads::pool::{self, RequestPool};

pub const CONTENT_TYPE: &str = "text/symlink";

const BODY_PREFIX: &str = "SYMLINK:";

pub fn check(_path: &str, req: &Request) -> Option<Kind> {
    if req.response_header("content-type") == Some(CONTENT_TYPE) {
        Some(Kind::Symlink(Default::default()))
    } else {
        None
    }
}

pub fn encode_target(target: &str) -> Vec<u8> {
    format!("{BODY_PREFIX}{target}").into_bytes()
}

pub fn set_target(obj: &Object, target: &str) -> i32 {
    let Kind::Symlink(state) = obj.kind() else {
        return -libc::EINVAL;
    };

    *state.target.lock() = Some(target.to_string());

    0
}

/// The link target, fetched from the remote body on first use.
pub fn read(obj: &Arc<Object>) -> Result<String, i32> {
    let Kind::Symlink(state) = obj.kind() else {
        return Err(-libc::EINVAL);
    };

    if let Some(target) = state.target.lock().clone() {
        return Ok(target);
    }

    let target_obj = obj.clone();
    let rc = pool::call(RequestPool::Primary, move |req| {
        fetch_target(&target_obj, req)
    });

    if rc != 0 {
        return Err(rc);
    }

    state.target.lock().clone().ok_or(-libc::EINVAL)
}

fn fetch_target(obj: &Object, req: &mut Request) -> i32 {
    req.init(Method::Get);
    req.set_url(obj.url(), None);

    if let Err(e) = req.run() {
        warn!("failed to read symlink [{}]: {e}", obj.url());
        return -libc::EIO;
    }

    if req.response_code() != HTTP_OK {
        debug!("symlink read of [{}] returned {}", obj.url(), req.response_code());
        return -libc::EIO;
    }

    let Ok(body) = std::str::from_utf8(req.response_body()) else {
        return -libc::EINVAL;
    };

    let Some(target) = body.strip_prefix(BODY_PREFIX) else {
        warn!("object at [{}] is not a valid symlink", obj.url());
        return -libc::EINVAL;
    };

    let Kind::Symlink(state) = obj.kind() else {
        return -libc::EINVAL;
    };

    *state.target.lock() = Some(target.to_string());

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_encoding() {
        assert_eq!(encode_target("/x/y"), b"SYMLINK:/x/y");
        assert_eq!(encode_target(""), b"SYMLINK:");
    }
}
