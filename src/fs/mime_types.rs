//! Extension-to-content-type mapping, loaded from `mime.types` files.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::debug;
use parking_lot::RwLock;

use crate::base::{config, paths};

const DEFAULT_FILES: &[&str] = &["/etc/mime.types", "/etc/httpd/mime.types"];

static TYPES: RwLock<Option<HashMap<String, String>>> = RwLock::new(None);

fn load_from(path: &Path, map: &mut HashMap<String, String>) {
    let Ok(file) = File::open(path) else {
        return;
    };

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            break;
        };

        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => &line[..],
        };

        let mut fields = line.split_whitespace();

        let Some(mime_type) = fields.next() else {
            continue;
        };

        for extension in fields {
            map.entry(extension.to_ascii_lowercase())
                .or_insert_with(|| mime_type.to_string());
        }
    }
}

pub fn init() {
    let mut map = HashMap::new();

    let configured = config::get().mime_types_file.clone();
    if !configured.is_empty() {
        load_from(Path::new(&paths::transform(&configured)), &mut map);
    }

    for file in DEFAULT_FILES {
        load_from(Path::new(file), &mut map);
    }

    debug!("mime_types: loaded {} extensions", map.len());

    *TYPES.write() = Some(map);
}

pub fn terminate() {
    *TYPES.write() = None;
}

/// Content type for a path, based on its (case-insensitive) extension.
pub fn from_path(path: &str) -> Option<String> {
    let extension = path.rsplit_once('.')?.1;

    if extension.contains('/') {
        return None;
    }

    TYPES
        .read()
        .as_ref()
        .and_then(|map| map.get(&extension.to_ascii_lowercase()).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(pairs: &[(&str, &str)]) {
        let mut map = HashMap::new();
        for (ext, ty) in pairs {
            map.insert(ext.to_string(), ty.to_string());
        }
        *TYPES.write() = Some(map);
    }

    // one test so the shared map is not rebuilt concurrently
    #[test]
    fn extension_lookup() {
        install(&[("txt", "text/plain"), ("jpg", "image/jpeg")]);

        assert_eq!(from_path("notes.txt").as_deref(), Some("text/plain"));
        assert_eq!(from_path("photo.JPG").as_deref(), Some("image/jpeg"));
        assert_eq!(from_path("archive.zip"), None);

        assert_eq!(from_path("Makefile"), None);
        assert_eq!(from_path("dir.d/file"), None);

        terminate();
    }
}
