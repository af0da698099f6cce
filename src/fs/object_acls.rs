//! Per-path canned ACLs.
//!
//! The configured file maps path prefixes to canned ACL names, one
//! `path acl` pair per line. Lookup returns the ACL of the longest
//! matching prefix on component boundaries; commits and uploads apply it
//! as the service's ACL header.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use log::{debug, warn};
use parking_lot::RwLock;

use crate::base::{config, paths};

static ACLS: RwLock<Option<HashMap<String, String>>> = RwLock::new(None);

fn load_from(path: &str, map: &mut HashMap<String, String>) {
    let Ok(file) = File::open(paths::transform(path)) else {
        return;
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let Ok(line) = line else {
            break;
        };

        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => &line[..],
        };

        let mut fields = line.split_whitespace();

        let (Some(acl_path), Some(acl)) = (fields.next(), fields.next()) else {
            if !line.trim().is_empty() {
                warn!("object_acls: line {}: expected `path acl`", index + 1);
            }
            continue;
        };

        map.insert(acl_path.trim_matches('/').to_string(), acl.to_string());
    }
}

pub fn init() {
    let mut map = HashMap::new();

    let configured = config::get().object_acls_file.clone();
    if !configured.is_empty() {
        load_from(&configured, &mut map);
    }

    debug!("object_acls: loaded {} entries", map.len());

    *ACLS.write() = Some(map);
}

pub fn terminate() {
    *ACLS.write() = None;
}

/// ACL of the longest prefix of `path` that appears in the map, if any.
pub fn get_acl(path: &str) -> Option<String> {
    let acls = ACLS.read();
    let map = acls.as_ref()?;

    if map.is_empty() {
        return None;
    }

    let mut candidate = path.trim_matches('/');

    loop {
        if let Some(acl) = map.get(candidate) {
            return Some(acl.clone());
        }

        match candidate.rsplit_once('/') {
            Some((parent, _)) => candidate = parent,
            None => break,
        }
    }

    map.get("").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(pairs: &[(&str, &str)]) {
        let mut map = HashMap::new();
        for (path, acl) in pairs {
            map.insert(path.to_string(), acl.to_string());
        }
        *ACLS.write() = Some(map);
    }

    // one test so the shared map is not rebuilt concurrently
    #[test]
    fn prefix_lookup() {
        install(&[("public", "public-read"), ("public/internal", "private")]);

        assert_eq!(get_acl("public/a.txt").as_deref(), Some("public-read"));
        assert_eq!(
            get_acl("public/internal/secrets.txt").as_deref(),
            Some("private")
        );
        assert_eq!(get_acl("other/file"), None);

        // matches stop at component boundaries
        install(&[("pub", "public-read")]);

        assert_eq!(get_acl("pub/x").as_deref(), Some("public-read"));
        assert_eq!(get_acl("publicly/x"), None);

        terminate();
    }
}
