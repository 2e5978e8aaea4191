//! Periodic traffic and cache statistics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default seconds between stats emissions.
pub const STATS_DELAY: u64 = 300;

/// Byte and cache counters for one export.
///
/// `srv_*` count bytes at the NBD layer; `store_*` count bytes exchanged
/// with the object store. The two differ because of caching and the
/// read-modify-write amplification of unaligned writes.
pub struct ExportStats {
    name: String,
    object_size: u64,
    cache_limit: usize,
    pub srv_in: AtomicU64,
    pub srv_out: AtomicU64,
    pub store_in: AtomicU64,
    pub store_out: AtomicU64,
    pub cache_entries: AtomicUsize,
}

impl ExportStats {
    pub fn new(name: &str, object_size: u64, cache_limit: usize) -> Self {
        Self {
            name: name.to_string(),
            object_size,
            cache_limit,
            srv_in: AtomicU64::new(0),
            srv_out: AtomicU64::new(0),
            store_in: AtomicU64::new(0),
            store_out: AtomicU64::new(0),
            cache_entries: AtomicUsize::new(0),
        }
    }

    /// Emit the STATS and CACHE lines for this export.
    pub fn log(&self) {
        log::info!(
            "STATS: {} in={} ({}), out={} ({})",
            self.name,
            self.srv_in.load(Ordering::Relaxed),
            self.store_in.load(Ordering::Relaxed),
            self.srv_out.load(Ordering::Relaxed),
            self.store_out.load(Ordering::Relaxed),
        );

        let size = self.cache_entries.load(Ordering::Relaxed) as u64 * self.object_size;
        let limit = self.cache_limit as u64 * self.object_size;
        let percent = if limit == 0 { 0 } else { size * 100 / limit };
        log::info!(
            "CACHE: {} size={} limit={} ({}%)",
            self.name,
            size,
            limit,
            percent
        );
    }
}

/// Background task logging every export's counters on a fixed period.
pub struct StatsReporter {
    stats: Vec<Arc<ExportStats>>,
    delay: Duration,
    stop: Arc<AtomicBool>,
}

impl StatsReporter {
    pub fn new(stats: Vec<Arc<ExportStats>>, delay: Duration, stop: Arc<AtomicBool>) -> Self {
        Self { stats, delay, stop }
    }

    /// Spawn the reporter thread. The stop flag is polled at sub-second
    /// granularity so shutdown is prompt.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut next = Instant::now() + self.delay;
            while !self.stop.load(Ordering::Relaxed) {
                if Instant::now() >= next {
                    for stats in &self.stats {
                        stats.log();
                    }
                    next = Instant::now() + self.delay;
                }
                thread::sleep(Duration::from_millis(250));
            }
        })
    }
}
