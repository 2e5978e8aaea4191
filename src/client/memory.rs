//! In-memory object store
//!
//! Backs the test suites and local experiments. ETags are real MD5 digests
//! unless corruption is enabled to exercise the integrity path.

use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{Headers, ObjectStore, StoreError, StoreResult};

#[derive(Default)]
struct Container {
    headers: Headers,
    objects: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, Container>,
    corrupt_etags: bool,
    get_count: u64,
    put_count: u64,
}

/// Shared in-memory store; clones refer to the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without going through the `ObjectStore` interface.
    pub fn insert_object(&self, container: &str, name: &str, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .containers
            .entry(container.to_string())
            .or_default()
            .objects
            .insert(name.to_string(), data);
    }

    /// Raw contents of an object, if present.
    pub fn object(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.containers.get(container)?.objects.get(name).cloned()
    }

    /// Container headers, if the container exists.
    pub fn headers(&self, container: &str) -> Option<Headers> {
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .get(container)
            .map(|c| c.headers.clone())
    }

    /// Object names in a container, in listing order.
    pub fn object_names(&self, container: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .get(container)
            .map(|c| c.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of GET object requests observed.
    pub fn get_count(&self) -> u64 {
        self.inner.lock().unwrap().get_count
    }

    /// Number of PUT object requests observed.
    pub fn put_count(&self) -> u64 {
        self.inner.lock().unwrap().put_count
    }

    /// Corrupt the ETag returned by subsequent PUTs.
    pub fn set_corrupt_etags(&self, corrupt: bool) {
        self.inner.lock().unwrap().corrupt_etags = corrupt;
    }
}

impl ObjectStore for MemoryStore {
    fn get_container(
        &self,
        container: &str,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> StoreResult<(Headers, Vec<String>)> {
        let inner = self.inner.lock().unwrap();
        let container = inner.containers.get(container).ok_or(StoreError::NotFound)?;
        let names = container
            .objects
            .keys()
            .filter(|name| marker.map_or(true, |marker| name.as_str() > marker))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok((container.headers.clone(), names))
    }

    fn put_container(&self, container: &str, headers: &Headers) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner.containers.entry(container.to_string()).or_default();
        // Swift only updates the headers sent with the request; a metadata
        // header posted with an empty value is removed, the rest are kept.
        for (key, value) in headers {
            if value.is_empty() {
                container.headers.remove(key);
            } else {
                container
                    .headers
                    .insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn get_object(&self, container: &str, name: &str) -> StoreResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_count += 1;
        inner
            .containers
            .get(container)
            .ok_or(StoreError::NotFound)?
            .objects
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn put_object(&self, container: &str, name: &str, data: &[u8]) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.put_count += 1;
        let corrupt = inner.corrupt_etags;
        let container = inner
            .containers
            .get_mut(container)
            .ok_or(StoreError::NotFound)?;
        container.objects.insert(name.to_string(), data.to_vec());

        if corrupt {
            Ok("0".repeat(32))
        } else {
            Ok(hex::encode(Md5::digest(data)))
        }
    }

    fn delete_object(&self, container: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .containers
            .get_mut(container)
            .ok_or(StoreError::NotFound)?
            .objects
            .remove(name)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn delete_container(&self, container: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let occupied = match inner.containers.get(container) {
            Some(c) => !c.objects.is_empty(),
            None => return Err(StoreError::NotFound),
        };
        if occupied {
            return Err(StoreError::Status(409));
        }
        inner.containers.remove(container);
        Ok(())
    }
}
