//! Filesystem-transported RPC fabric for synced datasite workspaces.
//!
//! Peers communicate by writing request and response files into
//! well-known paths of a shared directory tree; an external sync agent
//! replicates them. This crate provides the protocol and codec, an
//! event-driven dispatch server with a filesystem watcher, a
//! hierarchical permissions engine, an HTTP bridge tunneling plain
//! HTTP/1.1 over the file channel, and a periodic cleanup service.

pub mod bridge;
pub mod cleanup;
pub mod client;
pub mod perms;
pub mod protocol;
pub mod rpc;
pub mod server;

pub use client::{Client, ClientConfig, Workspace};
pub use syftbox_types::{SyftUrl, UrlError};
