//! Path and URL model for the syftbox RPC fabric.
//!
//! This crate provides the `syft://` URL type, relative/absolute path
//! guards, and subpath checks shared by the protocol, permissions, and
//! server layers.

pub mod path;
pub mod url;

pub use path::{ensure_absolute, ensure_relative, is_subpath, PathError};
pub use url::{looks_like_datasite, SyftUrl, UrlError};
