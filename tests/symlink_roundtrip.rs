//! Symlink bodies are `SYMLINK:<target>` under `text/symlink`, and read
//! back with truncate-and-NUL semantics.

mod common;

use s3fuse::operations::{self, Context};

#[test]
fn symlink_body_and_readback() {
    let remote = common::shared_remote();

    let ctx = Context { uid: 1000, gid: 1000 };

    assert_eq!(operations::symlink(&ctx, "/x/y", "/link"), 0);

    let stored = remote.stored("/test-bucket/link").expect("link was committed");
    assert_eq!(stored.body, b"SYMLINK:/x/y");

    let content_type = stored
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.as_str());
    assert_eq!(content_type, Some("text/symlink"));

    // force a clean fetch so readlink goes through the remote body
    s3fuse::fs::cache::remove("link");

    let mut buffer = [0u8; 64];
    assert_eq!(operations::readlink("/link", &mut buffer), 0);
    assert_eq!(&buffer[..5], b"/x/y\0");

    // a target longer than the buffer truncates but stays terminated
    let mut small = [0xffu8; 3];
    assert_eq!(operations::readlink("/link", &mut small), 0);
    assert_eq!(&small, b"/x\0");
}

#[test]
fn malformed_symlink_body_is_einval() {
    let remote = common::shared_remote();

    remote.insert("/test-bucket/bad", "text/symlink", b"not a symlink body", &[]);

    let mut buffer = [0u8; 64];
    assert_eq!(operations::readlink("/bad", &mut buffer), -libc::EINVAL);
}
