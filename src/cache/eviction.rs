use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;

use super::{BeaconCache, CacheObserver};

/// Cache observer that wakes the eviction task.
struct EvictionSignal {
    notify: Arc<Notify>,
}

impl CacheObserver for EvictionSignal {
    fn on_data_changed(&self) {
        self.notify.notify_one();
    }
}

/// Evicts cached records by age and by size.
///
/// Runs as a background task woken whenever the cache size changes. The
/// time strategy removes records past `max_record_age` unconditionally; the
/// space strategy engages above `high_water_bytes` and round-robins the
/// partitions in creation order, dropping one oldest record per partition
/// per pass, until the cache is at or below `low_water_bytes` or no further
/// progress is possible. In-transit records are never evicted.
pub struct CacheEvictor {
    cache: Arc<BeaconCache>,
    cfg: CacheConfig,
}

impl CacheEvictor {
    pub fn new(cache: Arc<BeaconCache>, cfg: CacheConfig) -> Self {
        Self { cache, cfg }
    }

    /// Spawns the eviction task; it exits on cancellation.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let notify = Arc::new(Notify::new());
        let signal = Arc::new(EvictionSignal {
            notify: Arc::clone(&notify),
        });
        self.cache
            .register_observer(Arc::downgrade(&signal) as std::sync::Weak<dyn CacheObserver>);

        info!(
            max_record_age = ?self.cfg.max_record_age,
            low_water_bytes = self.cfg.low_water_bytes,
            high_water_bytes = self.cfg.high_water_bytes,
            "cache eviction started",
        );

        tokio::spawn(async move {
            // Keeps the observer registration alive for the task lifetime.
            let _signal = signal;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cache eviction stopped");
                        return;
                    }
                    _ = notify.notified() => {
                        self.evict_once();
                    }
                }
            }
        })
    }

    /// Runs one eviction cycle: time strategy, then space strategy.
    pub fn evict_once(&self) {
        self.evict_by_age();
        self.evict_by_size();
    }

    fn evict_by_age(&self) {
        let max_age_ms = self.cfg.max_record_age.as_millis() as i64;
        if max_age_ms <= 0 {
            return;
        }

        let mut evicted = 0usize;
        for session_id in self.cache.session_ids() {
            evicted += self.cache.evict_records_by_age(session_id, max_age_ms);
        }

        if evicted > 0 {
            debug!(evicted, "evicted expired records");
        }
    }

    fn evict_by_size(&self) {
        if self.cache.num_bytes_in_cache() <= self.cfg.high_water_bytes {
            return;
        }

        let mut evicted = 0usize;
        'outer: while self.cache.num_bytes_in_cache() > self.cfg.low_water_bytes {
            let mut progressed = false;
            for session_id in self.cache.session_ids() {
                let removed = self.cache.evict_records_by_number(session_id, 1);
                evicted += removed;
                progressed |= removed > 0;

                if self.cache.num_bytes_in_cache() <= self.cfg.low_water_bytes {
                    break 'outer;
                }
            }
            if !progressed {
                break;
            }
        }

        if evicted > 0 {
            debug!(
                evicted,
                cache_bytes = self.cache.num_bytes_in_cache(),
                "evicted records over size bound",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use crate::clock::TimingProvider;

    use super::*;

    struct TestClock(AtomicI64);

    impl TimingProvider for TestClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn evictor(cache: &Arc<BeaconCache>, low: u64, high: u64, max_age_ms: u64) -> CacheEvictor {
        CacheEvictor::new(
            Arc::clone(cache),
            CacheConfig {
                max_record_age: std::time::Duration::from_millis(max_age_ms),
                low_water_bytes: low,
                high_water_bytes: high,
            },
        )
    }

    fn record_of(len: usize) -> String {
        "x".repeat(len)
    }

    #[test]
    fn test_space_eviction_reaches_low_water() {
        let clock = Arc::new(TestClock(AtomicI64::new(1_000_000)));
        let cache = Arc::new(BeaconCache::new(clock as Arc<dyn TimingProvider>));

        // 1200 bytes across 3 partitions, oldest records first per partition.
        for session in 0..3 {
            for i in 0..4 {
                cache.add_event_data(session, i, &record_of(100));
            }
        }
        assert_eq!(cache.num_bytes_in_cache(), 1_200);

        evictor(&cache, 800, 1_000, 0).evict_once();

        assert!(cache.num_bytes_in_cache() <= 800);
        // Remaining records are the newest of each partition.
        for session in 0..3 {
            assert!(!cache.is_empty(session));
        }
    }

    #[test]
    fn test_space_eviction_idle_below_high_water() {
        let clock = Arc::new(TestClock(AtomicI64::new(1_000_000)));
        let cache = Arc::new(BeaconCache::new(clock as Arc<dyn TimingProvider>));
        cache.add_event_data(1, 1, &record_of(500));

        evictor(&cache, 800, 1_000, 0).evict_once();
        assert_eq!(cache.num_bytes_in_cache(), 500);
    }

    #[test]
    fn test_space_eviction_spares_in_transit_records() {
        let clock = Arc::new(TestClock(AtomicI64::new(1_000_000)));
        let cache = Arc::new(BeaconCache::new(clock as Arc<dyn TimingProvider>));

        cache.add_event_data(1, 1, &record_of(600));
        let chunk = cache.get_next_beacon_chunk(1, "", 2_048, '&');
        assert!(!chunk.is_empty());
        cache.add_event_data(2, 2, &record_of(600));

        evictor(&cache, 100, 200, 0).evict_once();

        // The pending record is gone; the in-transit one survives.
        assert_eq!(cache.num_bytes_in_cache(), 600);
        cache.reset_chunked_data(1);
        assert!(!cache.is_empty(1));
        assert!(cache.is_empty(2));
    }

    #[test]
    fn test_age_eviction_removes_expired_records() {
        let clock = Arc::new(TestClock(AtomicI64::new(100_000)));
        let cache = Arc::new(BeaconCache::new(
            Arc::clone(&clock) as Arc<dyn TimingProvider>
        ));

        cache.add_event_data(1, 10_000, &record_of(50));
        cache.add_event_data(1, 99_500, &record_of(50));

        // Records older than 1s are expired; only the first qualifies.
        evictor(&cache, 10_000, 20_000, 1_000).evict_once();

        assert_eq!(cache.num_bytes_in_cache(), 50);
        let chunk = cache.get_next_beacon_chunk(1, "p", 1_024, '&');
        assert!(chunk.contains(&record_of(50)));
    }

    #[tokio::test]
    async fn test_eviction_task_wakes_on_cache_writes() {
        let clock = Arc::new(TestClock(AtomicI64::new(1_000_000)));
        let cache = Arc::new(BeaconCache::new(clock as Arc<dyn TimingProvider>));

        let cancel = CancellationToken::new();
        let handle = evictor(&cache, 100, 200, 0).spawn(cancel.clone());

        for i in 0..10 {
            cache.add_event_data(1, i, &record_of(50));
        }

        // The task is woken by the observer; poll until it catches up.
        for _ in 0..50 {
            if cache.num_bytes_in_cache() <= 100 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(cache.num_bytes_in_cache() <= 100);

        cancel.cancel();
        handle.await.expect("eviction task join failed");
    }
}
