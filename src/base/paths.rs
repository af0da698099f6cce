//! Path validation and transformation.
//!
//! Paths arriving from the kernel bridge are absolute. `validate` enforces
//! the invariants every operation shares and strips the leading slash so
//! the rest of the crate works with bucket-relative keys.

use std::env;

use log::{debug, warn};

const NAME_MAX: usize = 255;

/// Checks a path from the kernel bridge and returns it with the leading
/// slash removed. The root path maps to the empty string.
pub fn validate(path: &str) -> Result<&str, i32> {
    if !path.starts_with('/') {
        warn!("expected leading slash: [{path}]");
        return Err(-libc::EINVAL);
    }

    if path.len() > 1 && path.ends_with('/') {
        warn!("invalid trailing slash: [{path}]");
        return Err(-libc::EINVAL);
    }

    let stripped = &path[1..];

    let last = stripped.rsplit('/').next().unwrap_or(stripped);
    if last.len() > NAME_MAX {
        debug!("final component of [{path}] exceeds {NAME_MAX} characters");
        return Err(-libc::ENAMETOOLONG);
    }

    Ok(stripped)
}

/// Returns the parent of a bucket-relative key, or the empty string (the
/// bucket root) for a top-level key.
pub fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

/// Expands a leading `~/` using `$HOME`, for user-supplied file names in
/// the configuration.
pub fn transform(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }

    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_required() {
        assert_eq!(validate("foo"), Err(-libc::EINVAL));
        assert_eq!(validate(""), Err(-libc::EINVAL));
        assert_eq!(validate("/foo"), Ok("foo"));
    }

    #[test]
    fn root_is_empty_key() {
        assert_eq!(validate("/"), Ok(""));
    }

    #[test]
    fn trailing_slash_rejected_except_root() {
        assert_eq!(validate("/foo/"), Err(-libc::EINVAL));
        assert_eq!(validate("/foo/bar/"), Err(-libc::EINVAL));
    }

    #[test]
    fn long_final_component() {
        let ok = format!("/dir/{}", "a".repeat(NAME_MAX));
        let too_long = format!("/dir/{}", "a".repeat(NAME_MAX + 1));

        assert!(validate(&ok).is_ok());
        assert_eq!(validate(&too_long), Err(-libc::ENAMETOOLONG));
    }

    #[test]
    fn parent_of_key() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("top"), "");
    }
}
