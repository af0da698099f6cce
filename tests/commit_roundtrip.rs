//! Commit, drop the cache, re-fetch: stat fields and serializable user
//! xattrs survive the trip.

mod common;

use common::{MockRemote, TestService};
use s3fuse::fs::cache;
use s3fuse::operations::{self, Context};

#[test]
fn committed_metadata_survives_a_refetch() {
    let remote = MockRemote::new();

    remote.insert("/test-bucket/doc.txt", "text/plain", b"hello", &[]);

    common::setup(TestService::new(remote.clone()), |_| {});

    let ctx = Context { uid: 0, gid: 0 };

    let original = cache::get("doc.txt").expect("doc.txt should resolve");

    assert_eq!(operations::chmod(&ctx, "/doc.txt", 0o640), 0);
    assert_eq!(
        operations::setxattr(
            "/doc.txt",
            "s3fuse_xattr_color",
            b"burgundy",
            0
        ),
        0
    );
    assert_eq!(operations::utimens("/doc.txt", 1_700_000_000), 0);

    // the remote now carries our serialized metadata
    let stored = remote.stored("/test-bucket/doc.txt").unwrap();
    let header = |name: &str| {
        stored
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };

    assert_eq!(header("x-test-meta-s3fuse-mode").as_deref(), Some("640"));
    assert_eq!(header("x-test-meta-color").as_deref(), Some("burgundy"));
    assert_eq!(
        header("x-test-meta-s3fuse-mtime").as_deref(),
        Some("1700000000")
    );

    cache::remove("doc.txt");

    let refetched = cache::get("doc.txt").expect("doc.txt should resolve again");
    assert!(!std::sync::Arc::ptr_eq(&original, &refetched));

    let before = original.copy_stat();
    let after = refetched.copy_stat();

    assert_eq!(after.mode, before.mode);
    assert_eq!(after.uid, before.uid);
    assert_eq!(after.gid, before.gid);
    assert_eq!(after.mtime, 1_700_000_000);
    assert_eq!(refetched.content_type(), original.content_type());

    assert_eq!(
        refetched.get_metadata("s3fuse_xattr_color").unwrap(),
        b"burgundy"
    );

    s3fuse::terminate();
}
