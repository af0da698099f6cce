//! Reserved remote metadata keys.
//!
//! These live under the service's meta-header prefix (`x-amz-meta-` and
//! friends). Everything under that prefix that does *not* start with
//! [`RESERVED_PREFIX`] is carried through as a user xattr.

/// Never exposed as (or accepted from) a user xattr.
pub const RESERVED_PREFIX: &str = "s3fuse-";

pub const LAST_UPDATE_ETAG: &str = "s3fuse-last-update-etag";
pub const MODE: &str = "s3fuse-mode";
pub const UID: &str = "s3fuse-uid";
pub const GID: &str = "s3fuse-gid";
pub const MTIME: &str = "s3fuse-mtime";

pub const FILE_TYPE: &str = "s3fuse-file-type";
pub const DEVICE: &str = "s3fuse-device";

// reserved for the encryption subsystem
pub const SHA256: &str = "s3fuse-sha256";
pub const ENC_IV: &str = "s3fuse-e-iv";
pub const ENC_METADATA: &str = "s3fuse-e-meta";
