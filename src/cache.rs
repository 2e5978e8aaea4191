//! In-memory object cache
//!
//! Bounded cache keyed by object index. When the limit is exceeded, one of
//! the least frequently referenced entries is released.

use std::collections::HashMap;

/// Cache of whole objects with frequency-of-reference eviction.
///
/// Every successful `get` or `set` increments the entry's reference counter.
/// An insertion that pushes the cache over its limit evicts a single victim
/// chosen from the two least-referenced entries other than the key just
/// inserted; ties are broken towards the smaller object index.
pub struct Cache {
    limit: usize,
    refs: HashMap<u64, u64>,
    data: HashMap<u64, Vec<u8>>,
}

impl Cache {
    pub fn new(limit: usize) -> Self {
        log::debug!("cache size: {} objects", limit);
        Self {
            limit,
            refs: HashMap::new(),
            data: HashMap::new(),
        }
    }

    /// Get an element from the cache.
    pub fn get(&mut self, object_num: u64) -> Option<&[u8]> {
        match self.refs.get_mut(&object_num) {
            Some(count) => {
                *count += 1;
                log::debug!("cache get hit: {}, {}", object_num, count);
                self.data.get(&object_num).map(Vec::as_slice)
            }
            None => {
                log::debug!("cache get miss: {}", object_num);
                None
            }
        }
    }

    /// Put/update an element in the cache.
    pub fn set(&mut self, object_num: u64, data: Vec<u8>) {
        self.data.insert(object_num, data);
        let count = self.refs.entry(object_num).or_insert(0);
        *count += 1;
        log::debug!("cache set: {}, {}", object_num, count);

        if self.data.len() > self.limit {
            log::debug!(
                "cache size is over limit ({} > {})",
                self.data.len(),
                self.limit
            );
            if let Some(victim) = self.victim(object_num) {
                log::debug!("cache free: {}, {}", victim, self.refs[&victim]);
                self.refs.remove(&victim);
                self.data.remove(&victim);
            }
        }
    }

    /// Pick the entry to release: the first of the two least-referenced
    /// entries, in `(reference count, object index)` order, that is not
    /// `keep`.
    fn victim(&self, keep: u64) -> Option<u64> {
        let mut entries: Vec<(u64, u64)> = self
            .refs
            .iter()
            .map(|(&object_num, &count)| (count, object_num))
            .collect();
        entries.sort_unstable();
        entries
            .iter()
            .take(2)
            .map(|&(_, object_num)| object_num)
            .find(|&object_num| object_num != keep)
    }

    /// Flush the cache.
    pub fn flush(&mut self) {
        log::debug!("cache flush, was {}", self.data.len());
        self.refs.clear();
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
