//! Object store client boundary
//!
//! The block layer talks to the remote store through the `ObjectStore`
//! trait. `swift` implements the real Swift API; `memory` is an in-memory
//! store used by the test suites.

pub mod memory;
pub mod swift;

pub use memory::MemoryStore;
pub use swift::SwiftClient;

use std::collections::HashMap;
use thiserror::Error;

/// Object store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected status: {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for object store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Response headers, lowercase names.
pub type Headers = HashMap<String, String>;

/// Synchronous client for a Swift-compatible object store.
///
/// A 404 from the store surfaces as `StoreError::NotFound`; every other
/// non-2xx status is an error.
pub trait ObjectStore: Send {
    /// Container headers plus an object name listing. `limit` and `marker`
    /// page through large containers.
    fn get_container(
        &self,
        container: &str,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> StoreResult<(Headers, Vec<String>)>;

    /// Create the container or replace its metadata headers.
    fn put_container(&self, container: &str, headers: &Headers) -> StoreResult<()>;

    /// Full contents of an object.
    fn get_object(&self, container: &str, name: &str) -> StoreResult<Vec<u8>>;

    /// Store an object. Returns the ETag (lowercase MD5 hex) reported by
    /// the store.
    fn put_object(&self, container: &str, name: &str, data: &[u8]) -> StoreResult<String>;

    fn delete_object(&self, container: &str, name: &str) -> StoreResult<()>;

    fn delete_container(&self, container: &str) -> StoreResult<()>;
}
