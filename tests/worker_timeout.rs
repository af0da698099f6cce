//! A hung work item is re-posted by the watchdog until its retries run
//! out, the waiter gets `-ETIMEDOUT`, and the pool is restored to size.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{FnTransport, TestService};
use s3fuse::base::request::Request;
use s3fuse::threads::async_handle::WaitHandle;
use s3fuse::threads::pool::{self, RequestPool};
use s3fuse::threads::request_worker;

#[test]
fn timed_out_item_is_reposted_then_fails() {
    let transport = FnTransport(|req: &mut Request| req.simulate_response(200, &[], b""));

    common::setup(
        TestService::new(Arc::new(transport)),
        |config| config.request_timeout_in_s = 1,
    );

    assert_eq!(pool::pool_size(RequestPool::Primary), 8);

    let handle = Arc::new(WaitHandle::new());

    pool::post_with_retries(
        RequestPool::Primary,
        |_req| {
            // stand-in for a stalled transfer
            thread::sleep(Duration::from_secs(3));
            0
        },
        handle.clone(),
        1,
    );

    let started = Instant::now();
    assert_eq!(handle.wait(), -libc::ETIMEDOUT);

    // first timeout reposts, second gives up; both need a watchdog tick
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(request_worker::reposted_items(), 1);

    // the respawn counter may trail the completion by one tick
    let deadline = Instant::now() + Duration::from_secs(3);
    while pool::respawned_workers() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(pool::respawned_workers(), 2);
    assert_eq!(pool::pool_size(RequestPool::Primary), 8);
}
