//! Object extended attributes.
//!
//! An attribute either holds its bytes directly or computes them through
//! get/set callbacks (used for storage-class information). Serializable
//! attributes round-trip through remote metadata headers; values that are
//! not header-safe are base64-encoded with a marker prefix.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitflags::bitflags;

// Linux has no ENOATTR; it reports missing attributes as ENODATA
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const ENOATTR: libc::c_int = libc::ENODATA;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const ENOATTR: libc::c_int = libc::ENOATTR;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XattrMode: u32 {
        const WRITABLE = 0x1;
        const SERIALIZABLE = 0x2;
        /// Listed by `get_metadata_keys`.
        const VISIBLE = 0x4;
    }
}

pub type GetCallback = Arc<dyn Fn() -> Result<Vec<u8>, i32> + Send + Sync>;
pub type SetCallback = Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>;

const ENCODED_VALUE_MARKER: &str = "%b64%";

enum Value {
    Bytes(Vec<u8>),
    Callback {
        get: GetCallback,
        set: Option<SetCallback>,
    },
}

pub struct Xattr {
    key: String,
    mode: XattrMode,
    value: Value,
}

impl Xattr {
    pub fn from_bytes(key: &str, value: &[u8], mode: XattrMode) -> Self {
        Self {
            key: key.to_string(),
            mode,
            value: Value::Bytes(value.to_vec()),
        }
    }

    /// Builds an attribute from a remote metadata header, undoing the
    /// value encoding applied by `to_header`.
    pub fn from_header(key: &str, header_value: &str, mode: XattrMode) -> Self {
        let value = match header_value.strip_prefix(ENCODED_VALUE_MARKER) {
            Some(encoded) => BASE64
                .decode(encoded)
                .unwrap_or_else(|_| header_value.as_bytes().to_vec()),
            None => header_value.as_bytes().to_vec(),
        };

        Self {
            key: key.to_string(),
            mode,
            value: Value::Bytes(value),
        }
    }

    pub fn from_callbacks(
        key: &str,
        get: GetCallback,
        set: Option<SetCallback>,
        mode: XattrMode,
    ) -> Self {
        Self {
            key: key.to_string(),
            mode,
            value: Value::Callback { get, set },
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> XattrMode {
        self.mode
    }

    pub fn is_writable(&self) -> bool {
        self.mode.contains(XattrMode::WRITABLE)
    }

    pub fn is_serializable(&self) -> bool {
        self.mode.contains(XattrMode::SERIALIZABLE)
    }

    pub fn is_visible(&self) -> bool {
        self.mode.contains(XattrMode::VISIBLE)
    }

    pub fn value(&self) -> Result<Vec<u8>, i32> {
        match &self.value {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            Value::Callback { get, .. } => get(),
        }
    }

    pub fn set_value(&mut self, new_value: &[u8]) -> i32 {
        match &mut self.value {
            Value::Bytes(bytes) => {
                *bytes = new_value.to_vec();
                0
            }
            Value::Callback { set: Some(set), .. } => set(new_value),
            Value::Callback { set: None, .. } => -libc::EINVAL,
        }
    }

    /// Header representation of a serializable attribute.
    pub fn to_header(&self) -> Option<(String, String)> {
        if !self.is_serializable() {
            return None;
        }

        let bytes = self.value().ok()?;

        let value = if header_safe(&bytes) {
            String::from_utf8(bytes).expect("checked ascii")
        } else {
            format!("{ENCODED_VALUE_MARKER}{}", BASE64.encode(&bytes))
        };

        Some((self.key.clone(), value))
    }
}

fn header_safe(bytes: &[u8]) -> bool {
    if bytes.first() == Some(&b' ') || bytes.last() == Some(&b' ') {
        return false;
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        if text.starts_with(ENCODED_VALUE_MARKER) {
            return false;
        }
    } else {
        return false;
    }

    bytes.iter().all(|b| (0x20..0x7f).contains(b))
}

#[derive(Default)]
pub struct XattrMap {
    map: BTreeMap<String, Xattr>,
}

impl XattrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites.
    pub fn replace(&mut self, xattr: Xattr) {
        self.map.insert(xattr.key().to_string(), xattr);
    }

    pub fn get(&self, key: &str) -> Option<&Xattr> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Xattr> {
        self.map.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Xattr> {
        self.map.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Xattr> {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_value_round_trip() {
        let mut attr = Xattr::from_bytes(
            "color",
            b"blue",
            XattrMode::WRITABLE | XattrMode::SERIALIZABLE | XattrMode::VISIBLE,
        );

        assert_eq!(attr.value().unwrap(), b"blue");

        assert_eq!(attr.set_value(b"green"), 0);
        assert_eq!(attr.value().unwrap(), b"green");

        let (key, value) = attr.to_header().unwrap();
        assert_eq!(key, "color");
        assert_eq!(value, "green");
    }

    #[test]
    fn binary_value_is_encoded_in_headers() {
        let attr = Xattr::from_bytes("blob", &[0, 1, 2, 255], XattrMode::SERIALIZABLE);

        let (_, header_value) = attr.to_header().unwrap();
        assert!(header_value.starts_with(ENCODED_VALUE_MARKER));

        let decoded = Xattr::from_header("blob", &header_value, XattrMode::SERIALIZABLE);
        assert_eq!(decoded.value().unwrap(), &[0, 1, 2, 255]);
    }

    #[test]
    fn non_serializable_has_no_header() {
        let attr = Xattr::from_bytes("hidden", b"x", XattrMode::VISIBLE);
        assert!(attr.to_header().is_none());
    }

    #[test]
    fn callback_attr() {
        let computed = Arc::new(parking_lot::Mutex::new(b"STANDARD".to_vec()));

        let get_state = computed.clone();
        let set_state = computed.clone();

        let mut attr = Xattr::from_callbacks(
            "storage_class",
            Arc::new(move || Ok(get_state.lock().clone())),
            Some(Arc::new(move |v: &[u8]| {
                *set_state.lock() = v.to_vec();
                0
            })),
            XattrMode::WRITABLE | XattrMode::VISIBLE,
        );

        assert_eq!(attr.value().unwrap(), b"STANDARD");
        assert_eq!(attr.set_value(b"GLACIER"), 0);
        assert_eq!(attr.value().unwrap(), b"GLACIER");
    }

    #[test]
    fn read_only_callback_rejects_set() {
        let mut attr = Xattr::from_callbacks(
            "etag",
            Arc::new(|| Ok(b"\"123\"".to_vec())),
            None,
            XattrMode::VISIBLE,
        );

        assert_eq!(attr.set_value(b"nope"), -libc::EINVAL);
    }
}
