//! The in-memory representation of one remote path.
//!
//! An object is one of four variants (file, directory, symlink, special),
//! decided once at fetch time by a priority-ordered list of type checkers
//! examining the response. All variants share the metadata and commit
//! protocol; variant-specific behavior lives in the sibling modules.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::base::request::{self, HTTP_NO_CONTENT, HTTP_OK, Method, Request};
use crate::base::{config, timer};
use crate::fs::xattr::{Xattr, XattrMap, XattrMode};
use crate::fs::{cache, directory, metadata, mime_types, object_acls, special, symlink};
use crate::services;

pub const BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    File,
    Directory,
    Symlink,
    Special,
}

#[derive(Default)]
pub struct DirectoryState {
    pub(crate) children: Mutex<Option<Arc<Vec<String>>>>,
}

#[derive(Default)]
pub struct SymlinkState {
    pub(crate) target: Mutex<Option<String>>,
}

/// Variant tag plus variant-local state.
pub enum Kind {
    File,
    Directory(DirectoryState),
    Symlink(SymlinkState),
    Special,
}

impl Kind {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Kind::File => ObjectType::File,
            Kind::Directory(_) => ObjectType::Directory,
            Kind::Symlink(_) => ObjectType::Symlink,
            Kind::Special => ObjectType::Special,
        }
    }

    fn file_type_bits(&self) -> u32 {
        match self {
            Kind::File => libc::S_IFREG as u32,
            Kind::Directory(_) => libc::S_IFDIR as u32,
            Kind::Symlink(_) => libc::S_IFLNK as u32,
            // refined from the remote file-type header at init
            Kind::Special => libc::S_IFCHR as u32,
        }
    }
}

/// POSIX stat fields we track per object.
#[derive(Debug, Clone, Default)]
pub struct Stat {
    /// Includes the file-type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub size: u64,
    pub blocks: u64,
    pub rdev: u64,
}

struct Inner {
    stat: Stat,
    content_type: String,
    etag: String,
    last_update_etag: String,
    metadata: XattrMap,
}

/// A type checker inspects the fetch response and claims the object by
/// returning its variant; the first claim wins.
pub type TypeChecker = fn(path: &str, req: &Request) -> Option<Kind>;

fn file_check(_path: &str, _req: &Request) -> Option<Kind> {
    Some(Kind::File)
}

// priority order; the file checker accepts anything left over
const TYPE_CHECKERS: &[TypeChecker] =
    &[special::check, symlink::check, directory::check, file_check];

pub struct Object {
    path: String,
    url: String,
    kind: Kind,
    inner: Mutex<Inner>,
    /// Epoch seconds at which this descriptor goes stale; zero marks a
    /// freshly constructed object not yet committed to the cache.
    expiry: AtomicI64,
    /// Key of this object's entry in the open-file handle table. A
    /// non-owning link; the handle table owns the entry.
    open_file: Mutex<Option<u64>>,
}

/// URL path (bucket-relative, percent-encoded) for a non-directory key.
pub fn build_url(path: &str) -> String {
    format!("{}/{}", services::bucket_url(), request::url_encode(path))
}

fn effective_uid(configured: u32) -> u32 {
    if configured == u32::MAX {
        nix::unistd::geteuid().as_raw()
    } else {
        configured
    }
}

fn effective_gid(configured: u32) -> u32 {
    if configured == u32::MAX {
        nix::unistd::getegid().as_raw()
    } else {
        configured
    }
}

impl Object {
    /// A fresh, not-yet-committed object with configured defaults.
    pub fn new(path: &str, kind: Kind) -> Arc<Self> {
        let config = config::get();

        let content_type = match &kind {
            Kind::File => mime_types::from_path(path)
                .unwrap_or_else(|| config.default_content_type.clone()),
            Kind::Directory(_) => directory::CONTENT_TYPE.to_string(),
            Kind::Symlink(_) => symlink::CONTENT_TYPE.to_string(),
            Kind::Special => special::CONTENT_TYPE.to_string(),
        };

        let url = match &kind {
            Kind::Directory(_) => directory::build_url(path),
            _ => build_url(path),
        };

        let stat = Stat {
            mode: kind.file_type_bits() | (config.default_mode & !(libc::S_IFMT as u32)),
            uid: effective_uid(config.default_uid),
            gid: effective_gid(config.default_gid),
            mtime: timer::current_time(),
            size: 0,
            blocks: 0,
            rdev: 0,
        };

        Arc::new(Self {
            path: path.to_string(),
            url,
            kind,
            inner: Mutex::new(Inner {
                stat,
                content_type,
                etag: String::new(),
                last_update_etag: String::new(),
                metadata: XattrMap::new(),
            }),
            expiry: AtomicI64::new(0),
            open_file: Mutex::new(None),
        })
    }

    /// Builds an object from a successful fetch response.
    pub fn from_response(path: &str, req: &Request) -> Arc<Self> {
        let kind = TYPE_CHECKERS
            .iter()
            .find_map(|checker| checker(path, req))
            .expect("the file checker accepts everything");

        let object = Self::new(path, kind);
        object.init_from_response(req);
        object
    }

    fn init_from_response(&self, req: &Request) {
        let config = config::get();
        let meta_prefix = services::header_meta_prefix();

        let meta = |name: &str| req.response_header(&format!("{meta_prefix}{name}"));

        let mut inner = self.inner.lock();

        if let Some(content_type) = req.response_header("content-type") {
            inner.content_type = content_type.to_string();
        }

        inner.etag = req.response_header("etag").unwrap_or("").to_string();
        inner.last_update_etag = meta(metadata::LAST_UPDATE_ETAG).unwrap_or("").to_string();

        inner.stat.size = req
            .response_header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let type_bits = self.kind.file_type_bits();
        inner.stat.mode = type_bits
            | meta(metadata::MODE)
                .and_then(parse_octal)
                .unwrap_or(config.default_mode & !(libc::S_IFMT as u32));

        inner.stat.uid = meta(metadata::UID)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| effective_uid(config.default_uid));
        inner.stat.gid = meta(metadata::GID)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| effective_gid(config.default_gid));
        inner.stat.mtime = meta(metadata::MTIME)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(timer::current_time);

        if let Kind::Special = self.kind {
            special::init_from_response(&mut inner.stat, req, &meta_prefix);
        }

        // every unreserved header under the meta prefix is a user xattr
        for (name, value) in req.response_headers() {
            if let Some(key) = name.strip_prefix(&meta_prefix) {
                if !key.starts_with(metadata::RESERVED_PREFIX) {
                    inner.metadata.replace(Xattr::from_header(
                        key,
                        value,
                        XattrMode::WRITABLE | XattrMode::SERIALIZABLE | XattrMode::VISIBLE,
                    ));
                }
            }
        }

        let content_type = inner.content_type.clone();
        let etag = inner.etag.clone();
        inner.metadata.replace(Xattr::from_bytes(
            "content_type",
            content_type.as_bytes(),
            XattrMode::VISIBLE,
        ));
        inner
            .metadata
            .replace(Xattr::from_bytes("etag", etag.as_bytes(), XattrMode::VISIBLE));

        // when someone else rewrote the object without our metadata, fall
        // back to the HTTP modification time if it is newer
        let intact = inner.last_update_etag == inner.etag;
        if !intact && req.last_modified() > inner.stat.mtime {
            inner.stat.mtime = req.last_modified();
        }

        inner.stat.blocks = inner.stat.size.div_ceil(BLOCK_SIZE);

        drop(inner);

        if let Kind::File = self.kind {
            crate::fs::storage_class::attach(self, req);
        }

        // a positive expiry makes this object servable
        self.expiry.store(
            timer::current_time() + config.cache_expiry_in_s as i64,
            Ordering::SeqCst,
        );
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn object_type(&self) -> ObjectType {
        self.kind.object_type()
    }

    pub fn is_directory(&self) -> bool {
        self.object_type() == ObjectType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.object_type() == ObjectType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.object_type() == ObjectType::Symlink
    }

    pub fn copy_stat(&self) -> Stat {
        self.inner.lock().stat.clone()
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().stat.size
    }

    pub fn uid(&self) -> u32 {
        self.inner.lock().stat.uid
    }

    pub fn etag(&self) -> String {
        self.inner.lock().etag.clone()
    }

    pub fn content_type(&self) -> String {
        self.inner.lock().content_type.clone()
    }

    /// The metadata we last wrote still matches the remote content.
    pub fn is_intact(&self) -> bool {
        let inner = self.inner.lock();
        inner.last_update_etag == inner.etag
    }

    pub fn set_mode(&self, mode: u32) {
        let mut inner = self.inner.lock();
        let mode = mode & !(libc::S_IFMT as u32);

        let mode = if mode == 0 {
            config::get().default_mode & !(libc::S_IFMT as u32)
        } else {
            mode
        };

        inner.stat.mode = (inner.stat.mode & (libc::S_IFMT as u32)) | mode;
    }

    pub fn set_uid(&self, uid: u32) {
        self.inner.lock().stat.uid = uid;
    }

    pub fn set_gid(&self, gid: u32) {
        self.inner.lock().stat.gid = gid;
    }

    pub fn set_mtime(&self, mtime: i64) {
        self.inner.lock().stat.mtime = mtime;
    }

    pub fn set_size(&self, size: u64) {
        let mut inner = self.inner.lock();

        inner.stat.size = size;
        inner.stat.blocks = size.div_ceil(BLOCK_SIZE);
    }

    /// Adopts the etag returned by an upload; the object counts as intact
    /// until the next remote change.
    pub fn set_etag(&self, etag: &str) {
        let mut inner = self.inner.lock();

        inner.etag = etag.to_string();
        inner.last_update_etag = etag.to_string();

        inner
            .metadata
            .replace(Xattr::from_bytes("etag", etag.as_bytes(), XattrMode::VISIBLE));
    }

    pub fn is_valid(&self) -> bool {
        self.expiry.load(Ordering::SeqCst) > 0
    }

    pub fn is_expired(&self) -> bool {
        let expiry = self.expiry.load(Ordering::SeqCst);
        expiry == 0 || timer::current_time() >= expiry
    }

    /// Marks the descriptor stale so the next cache lookup re-fetches.
    pub fn expire(&self) {
        self.expiry.store(0, Ordering::SeqCst);
    }

    /// Makes the descriptor servable for the configured expiry window;
    /// used for objects built without a fetch (the bucket root).
    pub(crate) fn touch(&self) {
        self.expiry.store(
            timer::current_time() + config::get().cache_expiry_in_s as i64,
            Ordering::SeqCst,
        );
    }

    pub fn open_file_id(&self) -> Option<u64> {
        *self.open_file.lock()
    }

    pub fn set_open_file_id(&self, id: Option<u64>) {
        *self.open_file.lock() = id;
    }

    pub(crate) fn register_xattr(&self, xattr: Xattr) {
        self.inner.lock().metadata.replace(xattr);
    }

    /// Sets a user xattr. Returns whether the change needs a commit to
    /// reach the remote store.
    pub fn set_metadata(&self, key: &str, value: &[u8], flags: i32) -> Result<bool, i32> {
        let prefix = config::get().xattr_prefix.clone();

        let Some(user_key) = key.strip_prefix(&prefix) else {
            return Err(-libc::EINVAL);
        };

        // reserved names would collide with our own headers on commit
        if user_key.starts_with(metadata::RESERVED_PREFIX) {
            return Err(-libc::EINVAL);
        }

        let mut inner = self.inner.lock();
        let exists = inner.metadata.contains_key(user_key);

        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(-libc::EEXIST);
        }

        if !exists {
            if flags & libc::XATTR_REPLACE != 0 {
                return Err(-crate::fs::xattr::ENOATTR);
            }

            inner.metadata.replace(Xattr::from_bytes(
                user_key,
                value,
                XattrMode::WRITABLE | XattrMode::SERIALIZABLE | XattrMode::VISIBLE,
            ));

            return Ok(true);
        }

        let attr = inner.metadata.get_mut(user_key).expect("checked above");

        // read-only keys are listed, so applications copying all xattrs
        // will try to set them; succeed without changing anything
        if !attr.is_writable() {
            return Ok(false);
        }

        let rc = attr.set_value(value);
        if rc != 0 {
            return Err(rc);
        }

        Ok(attr.is_serializable())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Vec<u8>, i32> {
        let prefix = config::get().xattr_prefix.clone();

        let Some(user_key) = key.strip_prefix(&prefix) else {
            return Err(-crate::fs::xattr::ENOATTR);
        };

        let inner = self.inner.lock();

        match inner.metadata.get(user_key) {
            Some(attr) => attr.value(),
            None => Err(-crate::fs::xattr::ENOATTR),
        }
    }

    pub fn get_metadata_keys(&self) -> Vec<String> {
        let prefix = config::get().xattr_prefix.clone();
        let inner = self.inner.lock();

        inner
            .metadata
            .iter()
            .filter(|attr| attr.is_visible())
            .map(|attr| format!("{prefix}{}", attr.key()))
            .collect()
    }

    pub fn remove_metadata(&self, key: &str) -> i32 {
        let prefix = config::get().xattr_prefix.clone();

        let Some(user_key) = key.strip_prefix(&prefix) else {
            return -crate::fs::xattr::ENOATTR;
        };

        let mut inner = self.inner.lock();

        match inner.metadata.get(user_key) {
            Some(attr) if attr.is_writable() => {
                inner.metadata.remove(user_key);
                0
            }
            _ => -crate::fs::xattr::ENOATTR,
        }
    }

    /// Serializes this object's metadata onto an outgoing request: user
    /// xattrs re-prefixed, the reserved fields, content type, and any
    /// configured canned ACL.
    pub fn write_request_headers(&self, req: &mut Request) {
        let meta_prefix = services::header_meta_prefix();
        let inner = self.inner.lock();

        // user xattrs first, so reserved keys win any collision
        for attr in inner.metadata.iter() {
            if let Some((key, value)) = attr.to_header() {
                req.set_header(&format!("{meta_prefix}{key}"), &value);
            }
        }

        req.set_header(
            &format!("{meta_prefix}{}", metadata::MODE),
            &format!("{:o}", inner.stat.mode & !(libc::S_IFMT as u32)),
        );
        req.set_header(
            &format!("{meta_prefix}{}", metadata::UID),
            &inner.stat.uid.to_string(),
        );
        req.set_header(
            &format!("{meta_prefix}{}", metadata::GID),
            &inner.stat.gid.to_string(),
        );
        req.set_header(
            &format!("{meta_prefix}{}", metadata::MTIME),
            &inner.stat.mtime.to_string(),
        );
        req.set_header(
            &format!("{meta_prefix}{}", metadata::LAST_UPDATE_ETAG),
            &inner.etag,
        );

        req.set_header("Content-Type", &inner.content_type);

        if let Kind::Special = self.kind {
            special::write_request_headers(&inner.stat, req, &meta_prefix);
        }

        drop(inner);

        if let Some(acl) = object_acls::get_acl(&self.path) {
            req.set_header(&format!("{}acl", services::header_prefix()), &acl);
        }
    }

    fn write_request_body(&self, req: &mut Request) {
        if let Kind::Symlink(state) = &self.kind {
            let target = state.target.lock().clone().unwrap_or_default();
            req.set_input_bytes(symlink::encode_target(&target));
        }
    }

    /// Pushes this object's metadata (and variant body) to the remote
    /// store. An object that already exists remotely is updated in place
    /// with a copy onto itself.
    pub fn commit(&self, req: &mut Request) -> i32 {
        let header_prefix = services::header_prefix();
        let etag = self.etag();

        req.init(Method::Put);
        req.set_url(&self.url, None);

        if !etag.is_empty() {
            req.set_header(&format!("{header_prefix}copy-source"), &self.url);
            req.set_header(&format!("{header_prefix}copy-source-if-match"), &etag);
            req.set_header(&format!("{header_prefix}metadata-directive"), "REPLACE");
        }

        self.write_request_headers(req);
        self.write_request_body(req);

        if let Err(e) = req.run() {
            warn!("failed to commit [{}]: {e}", self.url);
            return -libc::EIO;
        }

        if req.response_code() != HTTP_OK {
            warn!(
                "commit of [{}] returned {}",
                self.url,
                req.response_code()
            );
            return -libc::EIO;
        }

        0
    }

    /// Deletes the remote object and drops it from the metadata cache.
    pub fn remove(&self, req: &mut Request) -> i32 {
        cache::remove(&self.path);

        remove_by_url(req, &self.url)
    }

    /// Copy-then-delete rename. Directories move their subtree first.
    pub fn rename(&self, req: &mut Request, to: &str) -> i32 {
        if let Kind::Directory(_) = self.kind {
            let rc = directory::rename_children(req, &self.path, to);

            if rc != 0 {
                return rc;
            }
        }

        let to_url = match &self.kind {
            Kind::Directory(_) => directory::build_url(to),
            _ => build_url(to),
        };

        let rc = copy_by_url(req, &self.url, &to_url);
        if rc != 0 {
            return rc;
        }

        self.remove(req)
    }
}

/// In-place copy used by rename; metadata travels with the object.
pub fn copy_by_url(req: &mut Request, from_url: &str, to_url: &str) -> i32 {
    let header_prefix = services::header_prefix();

    req.init(Method::Put);
    req.set_url(to_url, None);
    req.set_header(&format!("{header_prefix}copy-source"), from_url);
    req.set_header(&format!("{header_prefix}metadata-directive"), "COPY");

    if let Err(e) = req.run() {
        warn!("copy [{from_url}] -> [{to_url}] failed: {e}");
        return -libc::EIO;
    }

    if req.response_code() != HTTP_OK {
        debug!(
            "copy [{from_url}] -> [{to_url}] returned {}",
            req.response_code()
        );
        return -libc::EIO;
    }

    0
}

pub fn remove_by_url(req: &mut Request, url: &str) -> i32 {
    req.init(Method::Delete);
    req.set_url(url, None);

    if let Err(e) = req.run() {
        warn!("delete [{url}] failed: {e}");
        return -libc::EIO;
    }

    if req.response_code() != HTTP_NO_CONTENT {
        debug!("delete [{url}] returned {}", req.response_code());
        return -libc::EIO;
    }

    0
}

fn parse_octal(s: &str) -> Option<u32> {
    let digits = s.trim_start_matches("0o");

    if digits.is_empty() {
        return None;
    }

    u32::from_str_radix(digits, 8)
        .ok()
        .map(|mode| mode & !(libc::S_IFMT as u32))
}
