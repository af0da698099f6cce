//! The filesystem model: objects and their variants, the metadata cache,
//! and the open-file engine.

pub mod cache;
pub mod directory;
pub mod metadata;
pub mod mime_types;
pub mod object;
pub mod object_acls;
pub mod open_file;
pub mod open_file_map;
pub mod special;
pub mod storage_class;
pub mod symlink;
pub mod xattr;
