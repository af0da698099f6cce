//! A 12 MiB flush with a 5 MiB part size: one init, three parts (5, 5,
//! 2 MiB) on the background pool, one ordered completion, no abort.

mod common;

use std::sync::Arc;

use common::{FnTransport, TestService};
use parking_lot::Mutex;
use s3fuse::base::request::{HTTP_OK, Method, Request, TransportError};
use s3fuse::fs::cache;
use s3fuse::operations::{self, OpenFlags};
use s3fuse::services::aws::AwsFileTransfer;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, PartialEq)]
enum Event {
    Init,
    Part { number: usize, size: usize },
    Complete { body: String },
    Abort,
    Commit,
}

#[test]
fn twelve_mib_flush_uses_three_parts() {
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));

    let transport = {
        let events = events.clone();

        FnTransport(move |req: &mut Request| -> Result<(), TransportError> {
            let (_, query) = match req.url().split_once('?') {
                Some((url, query)) => (url, query),
                None => (req.url(), ""),
            };

            match req.method() {
                Method::Head => req.simulate_response(
                    HTTP_OK,
                    &[
                        ("Content-Type", "binary/octet-stream"),
                        ("Content-Length", "0"),
                        ("ETag", "\"original\""),
                    ],
                    b"",
                ),
                Method::Post if query == "uploads" => {
                    events.lock().push(Event::Init);

                    req.simulate_response(
                        HTTP_OK,
                        &[],
                        b"<InitiateMultipartUploadResult><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
                    )
                }
                Method::Post => {
                    let body = String::from_utf8(req.read_body()?).unwrap_or_default();
                    events.lock().push(Event::Complete { body });

                    req.simulate_response(
                        HTTP_OK,
                        &[],
                        b"<CompleteMultipartUploadResult><ETag>\"final-etag\"</ETag></CompleteMultipartUploadResult>",
                    )
                }
                Method::Put if query.starts_with("partNumber=") => {
                    let number: usize = query
                        .trim_start_matches("partNumber=")
                        .split('&')
                        .next()
                        .unwrap()
                        .parse()
                        .unwrap();
                    let size = req.read_body()?.len();

                    events.lock().push(Event::Part { number, size });

                    let etag = format!("\"part-{number}\"");
                    req.simulate_response(HTTP_OK, &[("ETag", etag.as_str())], b"")
                }
                Method::Put => {
                    events.lock().push(Event::Commit);
                    req.simulate_response(HTTP_OK, &[("ETag", "\"after-commit\"")], b"")
                }
                Method::Delete if query.starts_with("uploadId=") => {
                    events.lock().push(Event::Abort);
                    req.simulate_response(204, &[], b"")
                }
                _ => req.simulate_response(404, &[], b""),
            }
        })
    };

    common::setup(
        TestService::with_transfer(Arc::new(transport), Arc::new(AwsFileTransfer)),
        |config| config.upload_chunk_size = 5 * MIB,
    );

    let handle = operations::open("/big.bin", OpenFlags::TRUNCATE_TO_ZERO).unwrap();
    let object = cache::get("big.bin").expect("big.bin is cached while open");

    let data = vec![0x5au8; (12 * MIB) as usize];
    assert_eq!(operations::write(handle, &data, 0), data.len() as i32);

    assert_eq!(operations::release(handle), 0);

    let events = events.lock();

    assert_eq!(events[0], Event::Init);

    let mut part_sizes: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|event| match event {
            Event::Part { number, size } => Some((*number, *size)),
            _ => None,
        })
        .collect();
    part_sizes.sort_unstable();

    assert_eq!(
        part_sizes,
        vec![
            (1, (5 * MIB) as usize),
            (2, (5 * MIB) as usize),
            (3, (2 * MIB) as usize),
        ]
    );

    let complete = events
        .iter()
        .find_map(|event| match event {
            Event::Complete { body } => Some(body.clone()),
            _ => None,
        })
        .expect("completion request was sent");

    // parts appear in order, each with its etag
    let first = complete.find("<PartNumber>1</PartNumber><ETag>\"part-1\"</ETag>").unwrap();
    let second = complete.find("<PartNumber>2</PartNumber><ETag>\"part-2\"</ETag>").unwrap();
    let third = complete.find("<PartNumber>3</PartNumber><ETag>\"part-3\"</ETag>").unwrap();
    assert!(first < second && second < third);

    assert!(!events.contains(&Event::Abort));

    // the completion etag landed on the object
    assert_eq!(object.etag(), "\"final-etag\"");
}
