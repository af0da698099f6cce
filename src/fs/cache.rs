//! The object metadata cache: a bounded, process-wide map from paths to
//! shared object descriptors.
//!
//! Lookups that miss take a per-path lock before going to the remote
//! store, so concurrent opens of a cold path issue exactly one HEAD.
//! Eviction is LRU but skips objects with open handles; explicit removal
//! happens on delete and rename.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::base::lru_cache_map::LruCacheMap;
use crate::base::request::{HTTP_OK, Method, Request};
use crate::base::{config, statistics};
use crate::fs::object::{Kind, Object};
use crate::fs::directory;
use crate::threads::pool::{self, RequestPool};

/// Guides which URL a cold lookup tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    None,
    IsDir,
    IsFile,
}

static HITS: AtomicU64 = AtomicU64::new(0);
static MISSES: AtomicU64 = AtomicU64::new(0);
static EXPIRIES: AtomicU64 = AtomicU64::new(0);
static GET_FAILURES: AtomicU64 = AtomicU64::new(0);

type CacheMap = LruCacheMap<String, Option<Arc<Object>>>;

struct State {
    map: Mutex<CacheMap>,
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

static STATE: RwLock<Option<Arc<State>>> = RwLock::new(None);

fn removable(entry: &Option<Arc<Object>>) -> bool {
    match entry {
        Some(object) => object.open_file_id().is_none(),
        None => true,
    }
}

pub fn init() {
    *STATE.write() = Some(Arc::new(State {
        map: Mutex::new(CacheMap::with_removability(
            config::get().max_objects_in_cache,
            removable,
        )),
        fetch_locks: Mutex::new(HashMap::new()),
    }));

    statistics::register("object cache", |out| {
        let hits = HITS.load(Ordering::SeqCst);
        let misses = MISSES.load(Ordering::SeqCst);
        let expiries = EXPIRIES.load(Ordering::SeqCst);
        let total = (hits + misses + expiries).max(1);

        let size = STATE
            .read()
            .as_ref()
            .map_or(0, |state| state.map.lock().len());

        let _ = writeln!(out, "object cache:");
        let _ = writeln!(out, "  size: {size}");
        let _ = writeln!(out, "  hits: {hits} ({:.2} %)", statistics::percent(hits, total));
        let _ = writeln!(out, "  misses: {misses} ({:.2} %)", statistics::percent(misses, total));
        let _ = writeln!(
            out,
            "  expiries: {expiries} ({:.2} %)",
            statistics::percent(expiries, total)
        );
        let _ = writeln!(
            out,
            "  get failures: {}",
            GET_FAILURES.load(Ordering::SeqCst)
        );
    });
}

pub fn terminate() {
    *STATE.write() = None;
}

fn state() -> Arc<State> {
    STATE.read().clone().expect("metadata cache not initialized")
}

// Fast-path lookup under the global lock; bumps recency on a hit and
// drops stale entries.
fn lookup(state: &State, path: &str, counted: bool) -> Option<Arc<Object>> {
    let key = path.to_string();
    let mut map = state.map.lock();

    match map.find(&key) {
        Some(Some(object)) if object.is_valid() && !object.is_expired() => {
            map.get_or_default(&key);

            if counted {
                HITS.fetch_add(1, Ordering::SeqCst);
            }

            Some(object)
        }
        Some(_) => {
            map.erase(&key);

            if counted {
                EXPIRIES.fetch_add(1, Ordering::SeqCst);
            }

            None
        }
        None => {
            if counted {
                MISSES.fetch_add(1, Ordering::SeqCst);
            }

            None
        }
    }
}

fn path_lock(state: &State, path: &str) -> Arc<Mutex<()>> {
    state
        .fetch_locks
        .lock()
        .entry(path.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn release_path_lock(state: &State, path: &str, lock: Arc<Mutex<()>>) {
    let mut locks = state.fetch_locks.lock();

    // two references left means nobody else is waiting: the map's and ours
    if Arc::strong_count(&lock) <= 2 {
        locks.remove(path);
    }
}

fn fetch(req: &mut Request, path: &str, hint: Hint) -> Option<Arc<Object>> {
    // the bucket root is always a directory and needs no fetch
    if path.is_empty() {
        let root = Object::new("", Kind::Directory(Default::default()));
        root.touch();
        return Some(root);
    }

    req.init(Method::Head);

    if hint == Hint::None || hint == Hint::IsDir {
        // a directory, if one exists, answers on the trailing-slash URL
        req.set_url(&directory::build_url(path), None);

        if req.run().is_err() {
            GET_FAILURES.fetch_add(1, Ordering::SeqCst);
            return None;
        }
    }

    if hint == Hint::IsFile || req.response_code() != HTTP_OK {
        if hint == Hint::IsDir {
            GET_FAILURES.fetch_add(1, Ordering::SeqCst);
            return None;
        }

        req.init(Method::Head);
        req.set_url(&crate::fs::object::build_url(path), None);

        if req.run().is_err() {
            GET_FAILURES.fetch_add(1, Ordering::SeqCst);
            return None;
        }
    }

    if req.response_code() != HTTP_OK {
        GET_FAILURES.fetch_add(1, Ordering::SeqCst);
        return None;
    }

    Some(Object::from_response(path, req))
}

// Fetches through the primary pool and publishes the result, unless a
// racing fetcher beat us to it.
fn fetch_and_insert(state: &State, path: &str, hint: Hint) -> Option<Arc<Object>> {
    let fetched: Arc<Mutex<Option<Arc<Object>>>> = Arc::new(Mutex::new(None));

    let out = fetched.clone();
    let fetch_path = path.to_string();
    let rc = pool::call(RequestPool::Primary, move |req| {
        *out.lock() = fetch(req, &fetch_path, hint);
        0
    });

    if rc != 0 {
        debug!("fetch of [{path}] failed with {rc}");
        return None;
    }

    let object = fetched.lock().take()?;

    let key = path.to_string();
    let mut map = state.map.lock();
    let slot = map.get_or_default(&key);

    match slot {
        Some(existing) if existing.is_valid() && !existing.is_expired() => {
            // a racing fetcher won; ours is discarded
            Some(existing.clone())
        }
        _ => {
            *slot = Some(object.clone());
            Some(object)
        }
    }
}

/// Resolves `path` to its shared object, fetching from the remote store
/// at most once per path across all concurrent callers. Returns `None`
/// if the path does not exist remotely.
pub fn get(path: &str) -> Option<Arc<Object>> {
    get_with_hint(path, Hint::None)
}

pub fn get_with_hint(path: &str, hint: Hint) -> Option<Arc<Object>> {
    let state = state();

    if let Some(object) = lookup(&state, path, true) {
        return Some(object);
    }

    let lock = path_lock(&state, path);

    let object = {
        let _guard = lock.lock();

        // another fetcher may have finished while we waited
        match lookup(&state, path, false) {
            Some(object) => Some(object),
            None => fetch_and_insert(&state, path, hint),
        }
    };

    release_path_lock(&state, path, lock);

    object
}

/// Runs `callback` on the one and only cached object at `path` (fetched
/// if missing), with the per-path lock held for the duration.
pub fn lock_object(
    path: &str,
    hint: Hint,
    callback: impl FnOnce(Option<&Arc<Object>>) -> i32,
) -> i32 {
    let state = state();
    let lock = path_lock(&state, path);

    let rc = {
        let _guard = lock.lock();

        let object = match lookup(&state, path, false) {
            Some(object) => Some(object),
            None => fetch_and_insert(&state, path, hint),
        };

        callback(object.as_ref())
    };

    release_path_lock(&state, path, lock);

    rc
}

/// Evicts `path`; the next lookup goes back to the remote store.
pub fn remove(path: &str) {
    state().map.lock().erase(&path.to_string());
}
