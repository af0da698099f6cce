//! Configuration file handling.
//!
//! The configuration is a flat `key = value` file; `#` starts a comment.
//! Unknown keys, unparseable values, and missing required keys abort
//! initialization. The loaded record is a process-wide singleton.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use log::error;
use parking_lot::RwLock;
use thiserror::Error;

use crate::base::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot open configuration file: {0}")]
    Open(#[from] std::io::Error),
    #[error("error at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("required key `{0}` not defined")]
    MissingKey(&'static str),
    #[error("{0}")]
    Constraint(&'static str),
}

/// Declares the configuration record, its defaults, and the parser in one
/// table.
macro_rules! config_keys {
    ( $( $(#[$attr:meta])* $name:ident : $ty:ty = $default:expr ; )* ) => {
        #[derive(Debug, Clone)]
        pub struct Config {
            $( $(#[$attr])* pub $name: $ty, )*
        }

        impl Default for Config {
            fn default() -> Self {
                Self { $( $name: $default, )* }
            }
        }

        impl Config {
            fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
                match key {
                    $(
                        stringify!($name) => {
                            self.$name = parse_value(key, value, line)?;
                            Ok(())
                        }
                    )*
                    _ => Err(ConfigError::Malformed {
                        line,
                        reason: format!("unknown directive `{key}`"),
                    }),
                }
            }
        }
    };
}

config_keys! {
    /// Which service adapter to build: `aws`, `google-storage`, `fvs`, or
    /// `iijgio`.
    service: String = "aws".to_string();
    bucket_name: String = String::new();

    /// Mode bits applied when the remote object carries none.
    default_mode: u32 = 0o755;
    /// `u32::MAX` means "the effective uid/gid of this process".
    default_uid: u32 = u32::MAX;
    default_gid: u32 = u32::MAX;
    default_content_type: String = "binary/octet-stream".to_string();

    /// Namespace for user-settable extended attributes.
    xattr_prefix: String = "s3fuse_xattr_".to_string();

    cache_expiry_in_s: u64 = 180;
    max_objects_in_cache: usize = 1000;

    download_chunk_size: u64 = 128 * 1024;
    upload_chunk_size: u64 = 5 * 1024 * 1024;

    /// How long a single remote request may run before the pool watchdog
    /// declares it hung.
    request_timeout_in_s: u64 = 30;
    max_inconsistent_state_retries: u32 = 5;

    use_keychain: bool = false;
    object_acls_file: String = String::new();
    mime_types_file: String = String::new();

    aws_endpoint: String = "s3.amazonaws.com".to_string();
    aws_region: String = "us-east-1".to_string();
    aws_secret_file: String = String::new();
    aws_signature_version: u32 = 2;
    aws_use_ssl: bool = true;
    allow_glacier_restores: bool = false;

    gs_token_file: String = String::new();

    fvs_endpoint: String = String::new();
    iijgio_endpoint: String = "gss.iijgio.com".to_string();
}

trait FromConfig: Sized {
    fn from_config(value: &str) -> Result<Self, String>;
}

macro_rules! from_str_config {
    ($($ty:ty),*) => {
        $(
            impl FromConfig for $ty {
                fn from_config(value: &str) -> Result<Self, String> {
                    value.parse().map_err(|_| format!("cannot parse [{value}]"))
                }
            }
        )*
    };
}

from_str_config!(u32, u64, usize, String);

impl FromConfig for bool {
    fn from_config(value: &str) -> Result<Self, String> {
        match value.to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" | "on" => Ok(true),
            "no" | "false" | "0" | "off" => Ok(false),
            _ => Err(format!("cannot parse [{value}] as a boolean")),
        }
    }
}

fn parse_value<T: FromConfig>(key: &str, value: &str, line: usize) -> Result<T, ConfigError> {
    T::from_config(value).map_err(|reason| {
        error!("config: line {line}: {reason} for key [{key}]");
        ConfigError::Malformed {
            line,
            reason: format!("{reason} for key `{key}`"),
        }
    })
}

impl Config {
    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line_number = index + 1;
            let line = line?;

            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => &line[..],
            };

            if line.trim().is_empty() {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or(ConfigError::Malformed {
                line: line_number,
                reason: "missing '='".to_string(),
            })?;

            config.apply(key.trim(), value.trim(), line_number)?;
        }

        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.bucket_name.is_empty() {
            return Err(ConfigError::MissingKey("bucket_name"));
        }

        if self.max_objects_in_cache == 0 {
            return Err(ConfigError::Constraint("max_objects_in_cache must be positive"));
        }

        if self.download_chunk_size == 0 {
            return Err(ConfigError::Constraint("download_chunk_size must be positive"));
        }

        Ok(())
    }
}

static CONFIG: RwLock<Option<Arc<Config>>> = RwLock::new(None);

pub fn init(file: &Path) -> Result<(), ConfigError> {
    let file = File::open(paths::transform(&file.to_string_lossy()))?;

    init_with(Config::from_reader(file)?);

    Ok(())
}

/// Installs an already-built record; used by embedders and tests.
pub fn init_with(config: Config) {
    *CONFIG.write() = Some(Arc::new(config));
}

pub fn terminate() {
    *CONFIG.write() = None;
}

pub fn get() -> Arc<Config> {
    CONFIG
        .read()
        .clone()
        .expect("configuration not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_comments_and_whitespace() {
        let text = "\
# a comment
bucket_name = my-bucket
default_mode = 493 # 0o755
use_keychain = yes
cache_expiry_in_s=60
";
        let config = Config::from_reader(text.as_bytes()).unwrap();

        assert_eq!(config.bucket_name, "my-bucket");
        assert_eq!(config.default_mode, 493);
        assert!(config.use_keychain);
        assert_eq!(config.cache_expiry_in_s, 60);
        assert_eq!(config.service, "aws");
    }

    #[test]
    fn unknown_directive_aborts() {
        let result = Config::from_reader("bucket_name = b\nbogus = 1\n".as_bytes());
        assert!(matches!(result, Err(ConfigError::Malformed { line: 2, .. })));
    }

    #[test]
    fn missing_equals_aborts() {
        let result = Config::from_reader("bucket_name b\n".as_bytes());
        assert!(matches!(result, Err(ConfigError::Malformed { line: 1, .. })));
    }

    #[test]
    fn bad_type_aborts() {
        let result = Config::from_reader("bucket_name = b\ndefault_uid = many\n".as_bytes());
        assert!(matches!(result, Err(ConfigError::Malformed { line: 2, .. })));
    }

    #[test]
    fn required_key_enforced() {
        let result = Config::from_reader("default_uid = 1\n".as_bytes());
        assert!(matches!(result, Err(ConfigError::MissingKey("bucket_name"))));
    }
}
