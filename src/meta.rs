//! Container metadata codec
//!
//! Export parameters are stored on the container itself as
//! `x-container-meta-swiftnbd-*` headers.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header prefix for all swiftnbd metadata keys.
pub const META_PREFIX: &str = "x-container-meta-swiftnbd-";

/// Disk format version written by `setup`.
pub const DISK_VERSION: &str = "1";

const META_REQUIRED: [&str; 3] = ["version", "objects", "object-size"];

/// Convert a metadata map into container headers.
pub fn set_meta(meta: &HashMap<String, String>) -> HashMap<String, String> {
    meta.iter()
        .map(|(key, value)| (format!("{}{}", META_PREFIX, key), value.clone()))
        .collect()
}

/// Extract swiftnbd metadata from container headers.
///
/// Returns the empty map unless all of `version`, `objects` and
/// `object-size` are present; partial metadata means the container has not
/// been set up.
pub fn get_meta(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let meta: HashMap<String, String> = headers
        .iter()
        .filter(|(key, _)| key.to_lowercase().starts_with(META_PREFIX))
        .map(|(key, value)| (key[META_PREFIX.len()..].to_lowercase(), value.clone()))
        .collect();

    for key in META_REQUIRED {
        if !meta.contains_key(key) {
            return HashMap::new();
        }
    }
    meta
}

/// Parse the decimal `object-size` and `objects` values out of a metadata
/// map, in that order.
pub fn export_geometry(meta: &HashMap<String, String>) -> Option<(u64, u64)> {
    let object_size = meta.get("object-size")?.parse().ok()?;
    let objects = meta.get("objects")?.parse().ok()?;
    if object_size == 0 || objects == 0 {
        return None;
    }
    Some((object_size, objects))
}

/// Whether a disk format version can be served by this build. The major
/// version (text before the first `.`) must match.
pub fn version_compatible(found: &str) -> bool {
    major(found) == major(DISK_VERSION)
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Compose a lock holder value: `<client-id>@<unix-seconds>`.
pub fn lock_value(client_id: &str) -> String {
    format!("{}@{}", client_id, unix_seconds())
}

/// Seconds since the Unix epoch.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
