//! Block view over an object-split container
//!
//! Presents an export as a seekable byte window of `object_size * objects`
//! bytes. Reads and writes are split into object-aligned GETs and PUTs
//! against the remote store, with read-modify-write for partial edges and an
//! in-memory cache of whole objects. Exclusive access is recorded as
//! container metadata.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use md5::{Digest, Md5};
use thiserror::Error;

use crate::cache::Cache;
use crate::client::{ObjectStore, StoreError};
use crate::meta;
use crate::stats::ExportStats;

/// Storage errors, each mapping to the errno reported in NBD replies.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("already in use: {0}")]
    Busy(String),

    #[error("read only storage")]
    ReadOnly,

    #[error("offset out of bounds")]
    OutOfBounds,

    #[error("object integrity error (object {0})")]
    Integrity(u64),

    #[error("storage error: {0}")]
    Io(String),
}

impl StorageError {
    /// errno equivalent used in NBD error replies.
    pub fn errno(&self) -> u32 {
        match self {
            StorageError::Busy(_) => libc::EBUSY as u32,
            StorageError::ReadOnly => libc::EROFS as u32,
            StorageError::OutOfBounds => libc::ESPIPE as u32,
            StorageError::Integrity(_) => libc::EAGAIN as u32,
            StorageError::Io(_) => libc::EIO as u32,
        }
    }
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Object name for a 0-based index.
pub fn object_name(object_num: u64) -> String {
    format!("disk.part/{:08}", object_num)
}

/// Object-split view of one export.
pub struct SwiftStorage<C> {
    client: C,
    container: String,
    object_size: u64,
    objects: u64,
    read_only: bool,
    pos: u64,
    locked: bool,
    meta: HashMap<String, String>,
    cache: Cache,
    stats: Arc<ExportStats>,
}

impl<C: ObjectStore> SwiftStorage<C> {
    pub fn new(
        client: C,
        container: &str,
        object_size: u64,
        objects: u64,
        cache: Cache,
        read_only: bool,
        stats: Arc<ExportStats>,
    ) -> Self {
        Self {
            client,
            container: container.to_string(),
            object_size,
            objects,
            read_only,
            pos: 0,
            locked: false,
            meta: HashMap::new(),
            cache,
            stats,
        }
    }

    /// Total export size in bytes.
    pub fn size(&self) -> u64 {
        self.object_size * self.objects
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    fn object_pos(&self) -> u64 {
        self.pos % self.object_size
    }

    fn object_num(&self) -> u64 {
        self.pos / self.object_size
    }

    /// Record this instance as the exclusive holder of the container.
    ///
    /// A no-op when this instance already holds the lock.
    pub fn lock(&mut self, client_id: &str) -> StorageResult<()> {
        if self.locked {
            return Ok(());
        }

        let (headers, _) = self
            .client
            .get_container(&self.container, None, None)
            .map_err(|err| StorageError::Io(format!("failed to lock: {}", err)))?;
        self.meta = meta::get_meta(&headers);

        if self.meta.is_empty() {
            return Err(StorageError::Io(format!(
                "{} is not set up",
                self.container
            )));
        }

        if let Some(holder) = self.meta.get("client") {
            if !holder.is_empty() {
                return Err(StorageError::Busy(holder.clone()));
            }
        }

        self.meta
            .insert("client".to_string(), meta::lock_value(client_id));
        let headers = meta::set_meta(&self.meta);
        self.client
            .put_container(&self.container, &headers)
            .map_err(|err| StorageError::Io(format!("failed to lock: {}", err)))?;

        self.locked = true;
        Ok(())
    }

    /// Release the lock, preserving the previous holder in `last`.
    ///
    /// A no-op when this instance does not hold the lock.
    pub fn unlock(&mut self) -> StorageResult<()> {
        if !self.locked {
            return Ok(());
        }

        let holder = self.meta.get("client").cloned().unwrap_or_default();
        self.meta.insert("last".to_string(), holder);
        self.meta.insert("client".to_string(), String::new());
        let headers = meta::set_meta(&self.meta);
        self.client
            .put_container(&self.container, &headers)
            .map_err(|err| StorageError::Io(format!("failed to unlock: {}", err)))?;

        self.locked = false;
        Ok(())
    }

    /// Move the cursor. Valid offsets cover `0..=size`.
    pub fn seek(&mut self, offset: u64) -> StorageResult<()> {
        if offset > self.size() {
            return Err(StorageError::OutOfBounds);
        }
        self.pos = offset;
        Ok(())
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Read up to `size` bytes from the cursor, stopping at end of disk.
    pub fn read(&mut self, size: u64) -> StorageResult<Vec<u8>> {
        let mut data = Vec::with_capacity(size.min(self.size() - self.pos) as usize);
        let mut remaining = size;

        while remaining > 0 {
            if self.object_num() >= self.objects {
                break;
            }

            let object = self.fetch_object(self.object_num())?;
            let offset = self.object_pos();
            let part = if remaining + offset >= self.object_size {
                self.object_size - offset
            } else {
                remaining
            };

            data.extend_from_slice(&object[offset as usize..(offset + part) as usize]);
            remaining -= part;
            let pos = self.pos + part;
            self.seek(pos)?;
        }

        Ok(data)
    }

    /// Write `data` at the cursor.
    ///
    /// Partial first and last objects are read-modify-written; whole objects
    /// in between are replaced. The cursor is left at the aligned start of
    /// the written range (NBD seeks before every request).
    pub fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(());
        }

        // Validate the whole covered range up front so a write past the end
        // of the disk leaves the store untouched.
        let last = (self.pos + data.len() as u64 - 1) / self.object_size;
        if last >= self.objects {
            return Err(StorageError::OutOfBounds);
        }

        let mut buf = Vec::with_capacity(data.len() + 2 * self.object_size as usize);
        if self.object_pos() != 0 {
            // object-align the head
            let object = self.fetch_object(self.object_num())?;
            buf.extend_from_slice(&object[..self.object_pos() as usize]);
            let pos = self.pos - self.object_pos();
            self.seek(pos)?;
        }
        buf.extend_from_slice(data);

        let reminder = buf.len() as u64 % self.object_size;
        if reminder != 0 {
            // object-align the tail
            let tail_num = self.object_num() + buf.len() as u64 / self.object_size;
            let object = self.fetch_object(tail_num)?;
            buf.extend_from_slice(&object[reminder as usize..]);
        }

        debug_assert_eq!(buf.len() as u64 % self.object_size, 0);

        let mut object_num = self.object_num();
        for chunk in buf.chunks(self.object_size as usize) {
            self.put_object(object_num, chunk)?;
            object_num += 1;
        }
        Ok(())
    }

    /// Drop the cache. Writes are synchronous PUTs, so there is nothing to
    /// write back.
    pub fn flush(&mut self) {
        self.cache.flush();
        self.stats.cache_entries.store(0, Ordering::Relaxed);
    }

    /// Fetch a whole object, from cache or store. A missing object reads as
    /// zeros and is not cached.
    fn fetch_object(&mut self, object_num: u64) -> StorageResult<Vec<u8>> {
        if let Some(data) = self.cache.get(object_num) {
            return Ok(data.to_vec());
        }

        let name = object_name(object_num);
        let data = match self.client.get_object(&self.container, &name) {
            Ok(data) => data,
            Err(StoreError::NotFound) => return Ok(vec![0u8; self.object_size as usize]),
            Err(err) => return Err(StorageError::Io(err.to_string())),
        };

        if data.len() as u64 != self.object_size {
            return Err(StorageError::Io(format!(
                "invalid object size ({}), {} expected",
                data.len(),
                self.object_size
            )));
        }

        self.stats
            .store_in
            .fetch_add(self.object_size, Ordering::Relaxed);
        self.cache.set(object_num, data.clone());
        self.stats
            .cache_entries
            .store(self.cache.len(), Ordering::Relaxed);
        Ok(data)
    }

    /// Store one whole object and verify the reported ETag against the
    /// payload's MD5.
    fn put_object(&mut self, object_num: u64, data: &[u8]) -> StorageResult<()> {
        if object_num >= self.objects {
            return Err(StorageError::OutOfBounds);
        }

        let name = object_name(object_num);
        let etag = self
            .client
            .put_object(&self.container, &name, data)
            .map_err(|err| StorageError::Io(err.to_string()))?;

        let checksum = hex::encode(Md5::digest(data));
        if etag.to_lowercase() != checksum {
            return Err(StorageError::Integrity(object_num));
        }

        self.stats
            .store_out
            .fetch_add(self.object_size, Ordering::Relaxed);
        self.cache.set(object_num, data.to_vec());
        self.stats
            .cache_entries
            .store(self.cache.len(), Ordering::Relaxed);
        Ok(())
    }
}
