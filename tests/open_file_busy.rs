//! While one thread's flush is uploading, reads and writes on the same
//! handle return `-EBUSY`, and a second non-closing flush reports
//! success without doing anything.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{FnTransport, TestService};
use parking_lot::{Condvar, Mutex};
use s3fuse::base::request::{HTTP_OK, Method, Request, TransportError};
use s3fuse::operations::{self, OpenFlags};

#[derive(Default)]
struct Gate {
    upload_started: bool,
    upload_released: bool,
    first_upload_seen: bool,
}

#[test]
fn flush_in_progress_makes_io_busy() {
    let gate: Arc<(Mutex<Gate>, Condvar)> = Arc::new((Mutex::new(Gate::default()), Condvar::new()));

    let transport = {
        let gate = gate.clone();

        FnTransport(move |req: &mut Request| -> Result<(), TransportError> {
            match req.method() {
                Method::Head => req.simulate_response(
                    HTTP_OK,
                    &[
                        ("Content-Type", "binary/octet-stream"),
                        ("Content-Length", "0"),
                        ("ETag", "\"e1\""),
                    ],
                    b"",
                ),
                Method::Get => req.simulate_response(HTTP_OK, &[], b""),
                Method::Put => {
                    let (lock, condition) = &*gate;
                    let mut state = lock.lock();

                    // only the first upload blocks; later PUTs (the
                    // metadata commit, the closing flush) pass through
                    if !state.first_upload_seen {
                        state.first_upload_seen = true;
                        state.upload_started = true;
                        condition.notify_all();

                        while !state.upload_released {
                            condition.wait(&mut state);
                        }
                    }

                    drop(state);

                    req.simulate_response(HTTP_OK, &[("ETag", "\"e2\"")], b"")
                }
                _ => req.simulate_response(404, &[], b""),
            }
        })
    };

    common::setup(TestService::new(Arc::new(transport)), |_| {});

    let handle = operations::open("/busy.bin", OpenFlags::empty()).unwrap();

    assert_eq!(operations::write(handle, b"hello", 0), 5);

    let flusher = thread::spawn(move || operations::flush(handle));

    // wait until the upload is holding the entry in FLUSHING
    {
        let (lock, condition) = &*gate;
        let mut state = lock.lock();
        let deadline = Instant::now() + Duration::from_secs(5);

        while !state.upload_started {
            assert!(
                !condition.wait_until(&mut state, deadline).timed_out(),
                "upload never started"
            );
        }
    }

    let mut buffer = [0u8; 16];
    assert_eq!(operations::write(handle, b"x", 0), -libc::EBUSY);
    assert_eq!(operations::read(handle, &mut buffer, 0), -libc::EBUSY);
    assert_eq!(operations::ftruncate(handle, 0), -libc::EBUSY);

    // a second plain flush defers to the one in progress
    assert_eq!(operations::flush(handle), 0);

    {
        let (lock, condition) = &*gate;
        lock.lock().upload_released = true;
        condition.notify_all();
    }

    assert_eq!(flusher.join().unwrap(), 0);

    // the handle is usable again once the flush drains
    assert_eq!(operations::write(handle, b"world", 0), 5);
    assert_eq!(operations::read(handle, &mut buffer, 0), 5);

    assert_eq!(operations::release(handle), 0);

    // the handle is gone after the closing release
    assert_eq!(operations::write(handle, b"x", 0), -libc::EINVAL);
}
