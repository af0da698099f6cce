//! s3fuse — present a remote object store as a local POSIX filesystem.
//!
//! The crate turns bucket keys into files, directories, symlinks, and
//! special nodes. A bounded metadata cache maps paths to shared object
//! descriptors; an open-file engine stages blob contents in anonymous
//! local files and moves bytes with chunked, pooled transfers; a set of
//! request worker pools executes every remote call on long-lived,
//! signed HTTP clients. The kernel FUSE bridge, configuration loading,
//! and daemon startup live in collaborating crates; they drive the
//! [`operations`] module and the [`init`]/[`terminate`] pair below.

#![warn(rust_2018_idioms)]

use std::path::Path;

use thiserror::Error;

pub mod base;
pub mod fs;
pub mod operations;
pub mod services;
pub mod threads;

pub use crate::base::config::Config;
pub use crate::operations::{Context, FileStat, OpenFlags, StatFs};

pub const PACKAGE_NAME: &str = env!("CARGO_PKG_NAME");
pub const PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration: {0}")]
    Config(#[from] base::config::ConfigError),
    #[error("service: {0}")]
    Service(#[from] services::ServiceError),
}

/// Brings up the process-wide state from a configuration file, in
/// dependency order: configuration, service adapter, worker pools,
/// metadata cache, open-file table, auxiliary maps. (The HTTP client
/// library needs no global setup.)
pub fn init(config_file: &Path) -> Result<(), InitError> {
    base::config::init(config_file)?;

    init_common()
}

/// Like [`init`], but from an already-built configuration record.
pub fn init_with(config: Config) -> Result<(), InitError> {
    base::config::init_with(config);

    init_common()
}

fn init_common() -> Result<(), InitError> {
    let service = services::create(&base::config::get())?;
    services::init(service);

    threads::pool::init();

    fs::mime_types::init();
    fs::object_acls::init();
    fs::cache::init();
    fs::open_file_map::init();

    Ok(())
}

/// Tears everything down in reverse initialization order.
pub fn terminate() {
    fs::open_file_map::terminate();
    fs::cache::terminate();
    fs::object_acls::terminate();
    fs::mime_types::terminate();

    threads::pool::terminate();

    services::terminate();

    base::statistics::clear();
    base::config::terminate();
}
