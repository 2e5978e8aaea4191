//! NBD server for OpenStack Object Storage (Swift)
//!
//! This crate exposes Swift containers as fixed-size block devices over the
//! NBD protocol. Each export maps one container holding fixed-size objects;
//! reads and writes are translated into object GETs and PUTs, with an
//! in-memory cache of whole objects in between.

pub mod cache;
pub mod client;
pub mod config;
pub mod logging;
pub mod meta;
pub mod nbd;
pub mod stats;
pub mod storage;

pub use cache::Cache;
pub use client::{ObjectStore, StoreError};
pub use config::Secrets;
pub use storage::{StorageError, SwiftStorage};

/// Default authentication URL (TempAuth v1.0).
pub const DEFAULT_AUTH_URL: &str = "https://auth.storage.memset.com/v1.0";

/// Default secrets file location.
pub const DEFAULT_SECRETS_FILE: &str = "/etc/swiftnbd/secrets.conf";

/// Default object size in bytes.
pub const DEFAULT_OBJECT_SIZE: u64 = 64 * 1024;
