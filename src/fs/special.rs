//! Special (device, fifo, socket) objects.
//!
//! The POSIX file-type bits and the device number travel in reserved
//! metadata headers; the object body is empty.

use crate::base::request::Request;
use crate::fs::metadata;
use crate::fs::object::{Kind, Stat};

pub const CONTENT_TYPE: &str = "binary/s3fuse-special_0100"; // version 1.0

pub fn check(_path: &str, req: &Request) -> Option<Kind> {
    if req.response_header("content-type") == Some(CONTENT_TYPE) {
        Some(Kind::Special)
    } else {
        None
    }
}

pub(crate) fn init_from_response(stat: &mut Stat, req: &Request, meta_prefix: &str) {
    let file_type = req
        .response_header(&format!("{meta_prefix}{}", metadata::FILE_TYPE))
        .and_then(|v| u32::from_str_radix(v.trim_start_matches("0o"), 8).ok())
        .unwrap_or(libc::S_IFCHR as u32);

    stat.mode = (file_type & libc::S_IFMT as u32) | (stat.mode & !(libc::S_IFMT as u32));

    stat.rdev = req
        .response_header(&format!("{meta_prefix}{}", metadata::DEVICE))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
}

pub(crate) fn write_request_headers(stat: &Stat, req: &mut Request, meta_prefix: &str) {
    req.set_header(
        &format!("{meta_prefix}{}", metadata::FILE_TYPE),
        &format!("{:o}", stat.mode & libc::S_IFMT as u32),
    );
    req.set_header(
        &format!("{meta_prefix}{}", metadata::DEVICE),
        &stat.rdev.to_string(),
    );
}
