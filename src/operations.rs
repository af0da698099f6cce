//! The filesystem operation layer.
//!
//! Every operation the kernel bridge dispatches lands here. Paths arrive
//! absolute; they are validated and stripped of their leading slash
//! before touching the cache. Return values follow the kernel
//! convention: zero (or a byte count) on success, a negative errno on
//! failure.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};

use crate::base::request::Request;
use crate::base::{config, paths, statistics, timer};
use crate::fs::object::{BLOCK_SIZE, Kind, Object, Stat};
use crate::fs::{cache, directory, open_file_map, symlink};
use crate::threads::pool::{self, RequestPool};

pub use crate::fs::open_file_map::OpenFlags;

/// Caller identity, forwarded from the kernel bridge.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
}

/// Stat result handed back to the kernel bridge.
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub block_size: u64,
    pub mtime: i64,
    pub rdev: u64,
    pub nlink: u32,
}

#[derive(Debug, Clone)]
pub struct StatFs {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u64,
}

static MOUNTPOINT_MODE: AtomicU32 = AtomicU32::new(0);

static CREATES: AtomicU64 = AtomicU64::new(0);
static MKDIRS: AtomicU64 = AtomicU64::new(0);
static OPENS: AtomicU64 = AtomicU64::new(0);
static RENAMES: AtomicU64 = AtomicU64::new(0);
static SYMLINKS: AtomicU64 = AtomicU64::new(0);
static UNLINKS: AtomicU64 = AtomicU64::new(0);
static GETATTRS: AtomicU64 = AtomicU64::new(0);
static READDIRS: AtomicU64 = AtomicU64::new(0);
static READLINKS: AtomicU64 = AtomicU64::new(0);

static REOPEN_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static REOPEN_RESCUES: AtomicU64 = AtomicU64::new(0);
static REOPEN_FAILS: AtomicU64 = AtomicU64::new(0);

/// Records the mount point's mode for root getattr and registers the
/// operation counters.
pub fn init(mountpoint: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(mountpoint)?;

    MOUNTPOINT_MODE.store(
        libc::S_IFDIR as u32 | metadata.permissions().mode(),
        Ordering::SeqCst,
    );

    statistics::register("operations", |out| {
        let _ = writeln!(out, "operations (exceptions):");
        let _ = writeln!(out, "  reopen attempts: {}", REOPEN_ATTEMPTS.load(Ordering::SeqCst));
        let _ = writeln!(out, "  reopens rescued: {}", REOPEN_RESCUES.load(Ordering::SeqCst));
        let _ = writeln!(out, "  reopens failed: {}", REOPEN_FAILS.load(Ordering::SeqCst));
        let _ = writeln!(out, "operations (modifiers):");
        let _ = writeln!(out, "  create: {}", CREATES.load(Ordering::SeqCst));
        let _ = writeln!(out, "  mkdir: {}", MKDIRS.load(Ordering::SeqCst));
        let _ = writeln!(out, "  open: {}", OPENS.load(Ordering::SeqCst));
        let _ = writeln!(out, "  rename: {}", RENAMES.load(Ordering::SeqCst));
        let _ = writeln!(out, "  symlink: {}", SYMLINKS.load(Ordering::SeqCst));
        let _ = writeln!(out, "  unlink: {}", UNLINKS.load(Ordering::SeqCst));
        let _ = writeln!(out, "operations (accessors):");
        let _ = writeln!(out, "  getattr: {}", GETATTRS.load(Ordering::SeqCst));
        let _ = writeln!(out, "  readdir: {}", READDIRS.load(Ordering::SeqCst));
        let _ = writeln!(out, "  readlink: {}", READLINKS.load(Ordering::SeqCst));
    });

    Ok(())
}

macro_rules! validate_path {
    ($path:expr) => {
        match paths::validate($path) {
            Ok(path) => path,
            Err(rc) => return rc,
        }
    };
}

fn get_object(path: &str) -> Result<Arc<Object>, i32> {
    cache::get(path).ok_or(-libc::ENOENT)
}

fn check_owner(ctx: &Context, object: &Object) -> i32 {
    if ctx.uid != 0 && ctx.uid != object.uid() {
        return -libc::EPERM;
    }

    0
}

fn commit_object(object: Arc<Object>) -> i32 {
    pool::call(RequestPool::Primary, move |req: &mut Request| {
        object.commit(req)
    })
}

fn to_file_stat(stat: &Stat) -> FileStat {
    FileStat {
        mode: stat.mode,
        uid: stat.uid,
        gid: stat.gid,
        size: stat.size,
        blocks: stat.blocks,
        block_size: BLOCK_SIZE,
        mtime: stat.mtime,
        rdev: stat.rdev,
        nlink: 1, // calculating nlink is hard (see the FUSE FAQ re. find)
    }
}

pub fn chmod(ctx: &Context, path: &str, mode: u32) -> i32 {
    debug!("chmod: path: {path}, mode: {mode:#o}");

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    let rc = check_owner(ctx, &object);
    if rc != 0 {
        return rc;
    }

    object.set_mode(mode);

    commit_object(object)
}

pub fn chown(ctx: &Context, path: &str, uid: u32, gid: u32) -> i32 {
    debug!("chown: path: {path}, uid: {uid}, gid: {gid}");

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    let rc = check_owner(ctx, &object);
    if rc != 0 {
        return rc;
    }

    if uid != u32::MAX {
        object.set_uid(uid);
    }

    if gid != u32::MAX {
        object.set_gid(gid);
    }

    commit_object(object)
}

pub fn create(ctx: &Context, path: &str, mode: u32) -> Result<u64, i32> {
    debug!("create: path: {path}, mode: {mode:#o}");
    CREATES.fetch_add(1, Ordering::SeqCst);

    let path = paths::validate(path)?;

    if cache::get(path).is_some() {
        warn!("create: attempt to overwrite object at [{path}]");
        return Err(-libc::EEXIST);
    }

    directory::invalidate_parent(path);

    let file = Object::new(path, Kind::File);

    file.set_mode(mode);
    file.set_uid(ctx.uid);
    file.set_gid(ctx.gid);

    let rc = commit_object(file);
    if rc != 0 {
        return Err(rc);
    }

    // rarely, the newly created object is not immediately readable, so
    // retry the open a few times before giving up
    let retries = config::get().max_inconsistent_state_retries;
    let mut rescued = false;

    for attempt in 0..=retries {
        match open_file_map::open(path, OpenFlags::empty()) {
            Ok(handle) => {
                if rescued {
                    REOPEN_RESCUES.fetch_add(1, Ordering::SeqCst);
                }

                return Ok(handle);
            }
            Err(rc) if rc == -libc::ENOENT && attempt < retries => {
                warn!("create: retrying open on [{path}] because of error {rc}");
                REOPEN_ATTEMPTS.fetch_add(1, Ordering::SeqCst);
                rescued = true;

                timer::sleep(attempt as u64 + 1);
            }
            Err(rc) => {
                if rc == -libc::ENOENT {
                    REOPEN_FAILS.fetch_add(1, Ordering::SeqCst);
                }

                return Err(rc);
            }
        }
    }

    Err(-libc::ENOENT)
}

pub fn flush(handle: u64) -> i32 {
    debug!("flush: handle: {handle}");

    open_file_map::flush(handle, false)
}

pub fn ftruncate(handle: u64, length: u64) -> i32 {
    debug!("ftruncate: handle: {handle}, length: {length}");

    open_file_map::truncate(handle, length)
}

pub fn getattr(path: &str) -> Result<FileStat, i32> {
    GETATTRS.fetch_add(1, Ordering::SeqCst);

    let path = paths::validate(path)?;

    if path.is_empty() {
        return Ok(FileStat {
            mode: MOUNTPOINT_MODE.load(Ordering::SeqCst),
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            block_size: BLOCK_SIZE,
            nlink: 1,
            ..Default::default()
        });
    }

    let object = cache::get(path).ok_or(-libc::ENOENT)?;

    Ok(to_file_stat(&object.copy_stat()))
}

pub fn getxattr(path: &str, name: &str, buffer: &mut [u8]) -> i32 {
    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    let value = match object.get_metadata(name) {
        Ok(value) => value,
        Err(rc) => return rc,
    };

    if buffer.is_empty() {
        return value.len() as i32;
    }

    if value.len() > buffer.len() {
        return -libc::ERANGE;
    }

    buffer[..value.len()].copy_from_slice(&value);

    value.len() as i32
}

pub fn listxattr(path: &str, buffer: &mut [u8]) -> i32 {
    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    let keys = object.get_metadata_keys();
    let required: usize = keys.iter().map(|key| key.len() + 1).sum();

    if buffer.is_empty() {
        return required as i32;
    }

    if required > buffer.len() {
        return -libc::ERANGE;
    }

    let mut at = 0;
    for key in keys {
        buffer[at..at + key.len()].copy_from_slice(key.as_bytes());
        buffer[at + key.len()] = 0;
        at += key.len() + 1;
    }

    required as i32
}

pub fn mkdir(ctx: &Context, path: &str, mode: u32) -> i32 {
    debug!("mkdir: path: {path}, mode: {mode:#o}");
    MKDIRS.fetch_add(1, Ordering::SeqCst);

    let path = validate_path!(path);

    if cache::get(path).is_some() {
        warn!("mkdir: attempt to overwrite object at [{path}]");
        return -libc::EEXIST;
    }

    directory::invalidate_parent(path);

    let dir = Object::new(path, Kind::Directory(Default::default()));

    dir.set_mode(mode);
    dir.set_uid(ctx.uid);
    dir.set_gid(ctx.gid);

    commit_object(dir)
}

pub fn open(path: &str, flags: OpenFlags) -> Result<u64, i32> {
    debug!("open: path: {path}");
    OPENS.fetch_add(1, Ordering::SeqCst);

    let path = paths::validate(path)?;

    open_file_map::open(path, flags)
}

pub fn read(handle: u64, buffer: &mut [u8], offset: u64) -> i32 {
    open_file_map::read(handle, buffer, offset)
}

pub fn readdir(path: &str, filler: &mut dyn FnMut(&str)) -> i32 {
    debug!("readdir: path: {path}");
    READDIRS.fetch_add(1, Ordering::SeqCst);

    let path = validate_path!(path);

    let object = match cache::get(path) {
        Some(object) => object,
        None => return -libc::ENOENT,
    };

    if !object.is_directory() {
        return -libc::ENOTDIR;
    }

    let children = match directory::read(&object) {
        Ok(children) => children,
        Err(rc) => return rc,
    };

    filler(".");
    filler("..");

    for child in children.iter() {
        filler(child);
    }

    0
}

pub fn readlink(path: &str, buffer: &mut [u8]) -> i32 {
    debug!("readlink: path: {path}");
    READLINKS.fetch_add(1, Ordering::SeqCst);

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    if !object.is_symlink() {
        return -libc::EINVAL;
    }

    let target = match symlink::read(&object) {
        Ok(target) => target,
        Err(rc) => return rc,
    };

    if buffer.is_empty() {
        return -libc::EINVAL;
    }

    // leave room for the terminating null; longer targets truncate
    let len = target.len().min(buffer.len() - 1);

    buffer[..len].copy_from_slice(&target.as_bytes()[..len]);
    buffer[len] = 0;

    0
}

pub fn release(handle: u64) -> i32 {
    debug!("release: handle: {handle}");

    open_file_map::release(handle)
}

pub fn removexattr(path: &str, name: &str) -> i32 {
    debug!("removexattr: path: {path}, name: {name}");

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    let rc = object.remove_metadata(name);
    if rc != 0 {
        return rc;
    }

    commit_object(object)
}

pub fn rename(from: &str, to: &str) -> i32 {
    debug!("rename: from: {from}, to: {to}");
    RENAMES.fetch_add(1, Ordering::SeqCst);

    let from = validate_path!(from);
    let to = validate_path!(to);

    let from_object = match get_object(from) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    // the destination is allowed to be missing
    let to_object = cache::get(to);

    directory::invalidate_parent(from);
    directory::invalidate_parent(to);

    if let Some(to_object) = to_object {
        if to_object.is_directory() {
            if !from_object.is_directory() {
                return -libc::EISDIR;
            }

            match directory::is_empty(&to_object) {
                Ok(true) => {}
                Ok(false) => return -libc::ENOTEMPTY,
                Err(rc) => return rc,
            }
        } else if from_object.is_directory() {
            return -libc::ENOTDIR;
        }

        let rc = pool::call(RequestPool::Primary, move |req: &mut Request| {
            to_object.remove(req)
        });

        if rc != 0 {
            return rc;
        }
    }

    let to = to.to_string();
    pool::call(RequestPool::Primary, move |req: &mut Request| {
        from_object.rename(req, &to)
    })
}

pub fn rmdir(path: &str) -> i32 {
    unlink_impl("rmdir", path)
}

pub fn setxattr(path: &str, name: &str, value: &[u8], flags: i32) -> i32 {
    debug!("setxattr: path: {path}, name: {name}, size: {}", value.len());

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    match object.set_metadata(name, value, flags) {
        Ok(true) => commit_object(object),
        Ok(false) => 0,
        Err(rc) => rc,
    }
}

pub fn statfs() -> StatFs {
    StatFs {
        block_size: BLOCK_SIZE,
        blocks: u64::MAX,
        blocks_free: u64::MAX,
        blocks_available: u64::MAX,
        files: u64::MAX,
        files_free: u64::MAX,
        name_max: 1024,
    }
}

pub fn symlink(ctx: &Context, target: &str, path: &str) -> i32 {
    debug!("symlink: path: {path}, target: {target}");
    SYMLINKS.fetch_add(1, Ordering::SeqCst);

    let path = validate_path!(path);

    if cache::get(path).is_some() {
        warn!("symlink: attempt to overwrite object at [{path}]");
        return -libc::EEXIST;
    }

    directory::invalidate_parent(path);

    let link = Object::new(path, Kind::Symlink(Default::default()));

    link.set_uid(ctx.uid);
    link.set_gid(ctx.gid);

    let rc = symlink::set_target(&link, target);
    if rc != 0 {
        return rc;
    }

    commit_object(link)
}

pub fn unlink(path: &str) -> i32 {
    unlink_impl("unlink", path)
}

fn unlink_impl(op: &str, path: &str) -> i32 {
    debug!("{op}: path: {path}");
    UNLINKS.fetch_add(1, Ordering::SeqCst);

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    directory::invalidate_parent(path);

    pool::call(RequestPool::Primary, move |req: &mut Request| {
        object.remove(req)
    })
}

pub fn utimens(path: &str, mtime: i64) -> i32 {
    debug!("utimens: path: {path}, mtime: {mtime}");

    let path = validate_path!(path);

    let object = match get_object(path) {
        Ok(object) => object,
        Err(rc) => return rc,
    };

    object.set_mtime(mtime);

    commit_object(object)
}

pub fn write(handle: u64, buffer: &[u8], offset: u64) -> i32 {
    open_file_map::write(handle, buffer, offset)
}
