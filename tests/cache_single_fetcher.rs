//! Concurrent cold lookups of one path must issue exactly one HEAD.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{MockRemote, TestService};
use s3fuse::fs::cache;

#[test]
fn sixteen_concurrent_gets_issue_one_head() {
    let remote = MockRemote::new();

    remote.insert(
        "/test-bucket/foo",
        "binary/octet-stream",
        b"contents",
        &[("x-test-meta-s3fuse-mode", "644")],
    );
    remote.head_delay_ms.store(200, Ordering::SeqCst);

    common::setup(TestService::new(remote.clone()), |_| {});

    let barrier = Arc::new(Barrier::new(16));
    let mut threads = Vec::new();

    for _ in 0..16 {
        let barrier = barrier.clone();

        threads.push(thread::spawn(move || {
            barrier.wait();
            cache::get_with_hint("foo", cache::Hint::IsFile)
        }));
    }

    let objects: Vec<_> = threads
        .into_iter()
        .map(|t| t.join().unwrap().expect("foo should resolve"))
        .collect();

    assert_eq!(remote.head_count.load(Ordering::SeqCst), 1);

    // every caller sees the same shared descriptor
    for object in &objects[1..] {
        assert!(Arc::ptr_eq(object, &objects[0]));
    }

    assert_eq!(objects[0].size(), 8);

    s3fuse::terminate();
}
