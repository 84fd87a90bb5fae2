pub mod eviction;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::TimingProvider;

/// Notified after every size-modifying cache operation.
///
/// Notifications are edge-triggered and may be coalesced; implementations
/// must be reentrancy-safe and cheap, since reporter threads deliver them.
pub trait CacheObserver: Send + Sync {
    fn on_data_changed(&self);
}

/// One serialized event or action record. Immutable once appended.
#[derive(Debug)]
struct CacheRecord {
    timestamp: i64,
    data: String,
}

impl CacheRecord {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy)]
enum Lane {
    Event,
    Action,
}

/// Per-session record store.
///
/// Pending records live in two lanes (event and action, each age-ordered by
/// append time); records handed out in a chunk move to the in-transit
/// sub-lanes until the server acknowledges or the chunk is reset. The byte
/// counter covers pending and in-transit records.
#[derive(Debug, Default)]
struct PartitionData {
    events: VecDeque<CacheRecord>,
    actions: VecDeque<CacheRecord>,
    sent_events: Vec<CacheRecord>,
    sent_actions: Vec<CacheRecord>,
    bytes: u64,
}

impl PartitionData {
    /// Lane holding the oldest pending record; action lane wins ties.
    fn oldest_lane(&self) -> Option<Lane> {
        match (self.actions.front(), self.events.front()) {
            (Some(action), Some(event)) => {
                if action.timestamp <= event.timestamp {
                    Some(Lane::Action)
                } else {
                    Some(Lane::Event)
                }
            }
            (Some(_), None) => Some(Lane::Action),
            (None, Some(_)) => Some(Lane::Event),
            (None, None) => None,
        }
    }

    fn peek_oldest_len(&self) -> Option<usize> {
        let lane = self.oldest_lane()?;
        let record = match lane {
            Lane::Action => self.actions.front(),
            Lane::Event => self.events.front(),
        };
        record.map(|r| r.data.len())
    }

    fn pop_oldest(&mut self) -> Option<(CacheRecord, Lane)> {
        let lane = self.oldest_lane()?;
        let record = match lane {
            Lane::Action => self.actions.pop_front(),
            Lane::Event => self.events.pop_front(),
        };
        record.map(|r| (r, lane))
    }

    fn has_pending(&self) -> bool {
        !self.events.is_empty() || !self.actions.is_empty()
    }
}

#[derive(Debug, Default)]
struct Partition {
    data: RwLock<PartitionData>,
}

/// Concurrent in-memory store of serialized records, partitioned by session.
///
/// Reporter threads append under the partition lock of their own session and
/// never block on another partition; the global byte counter is an atomic.
pub struct BeaconCache {
    partitions: DashMap<i32, Arc<Partition>>,
    /// Session ids in partition creation order, for round-robin eviction.
    insertion_order: Mutex<Vec<i32>>,
    total_bytes: AtomicU64,
    observers: Mutex<Vec<Weak<dyn CacheObserver>>>,
    clock: Arc<dyn TimingProvider>,
}

impl BeaconCache {
    pub fn new(clock: Arc<dyn TimingProvider>) -> Self {
        Self {
            partitions: DashMap::new(),
            insertion_order: Mutex::new(Vec::new()),
            total_bytes: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Registers an observer; dead weak references are pruned on notify.
    pub fn register_observer(&self, observer: Weak<dyn CacheObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify_observers(&self) {
        let mut observers = self.observers.lock();
        observers.retain(|observer| match observer.upgrade() {
            Some(observer) => {
                observer.on_data_changed();
                true
            }
            None => false,
        });
    }

    fn existing_partition(&self, session_id: i32) -> Option<Arc<Partition>> {
        self.partitions
            .get(&session_id)
            .map(|partition| Arc::clone(&partition))
    }

    fn partition(&self, session_id: i32) -> Arc<Partition> {
        self.partitions
            .entry(session_id)
            .or_insert_with(|| {
                self.insertion_order.lock().push(session_id);
                Arc::new(Partition::default())
            })
            .clone()
    }

    fn add_record(&self, session_id: i32, timestamp: i64, payload: &str, lane: Lane) {
        let partition = self.partition(session_id);
        let record = CacheRecord {
            timestamp,
            data: payload.to_string(),
        };
        let size = record.size();

        {
            let mut data = partition.data.write();
            match lane {
                Lane::Event => data.events.push_back(record),
                Lane::Action => data.actions.push_back(record),
            }
            data.bytes += size;
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);

        self.notify_observers();
    }

    /// Appends a record to the session's event lane.
    pub fn add_event_data(&self, session_id: i32, timestamp: i64, payload: &str) {
        self.add_record(session_id, timestamp, payload, Lane::Event);
    }

    /// Appends a record to the session's action lane.
    pub fn add_action_data(&self, session_id: i32, timestamp: i64, payload: &str) {
        self.add_record(session_id, timestamp, payload, Lane::Action);
    }

    /// Drops the session's partition, pending and in-transit records alike.
    /// Idempotent.
    pub fn delete_cache_entry(&self, session_id: i32) {
        let Some((_, partition)) = self.partitions.remove(&session_id) else {
            return;
        };

        let freed = partition.data.read().bytes;
        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        self.insertion_order.lock().retain(|id| *id != session_id);

        self.notify_observers();
    }

    /// Builds the next outgoing chunk for a session.
    ///
    /// Pending records are concatenated oldest-first across both lanes
    /// (action lane wins ties) with `delimiter` between them, prefixed by
    /// `prefix`, stopping just before the total would exceed `max_size`.
    /// Consumed records move in-transit, not out of the cache. Returns an
    /// empty string when no record fits; nothing is moved in that case.
    pub fn get_next_beacon_chunk(
        &self,
        session_id: i32,
        prefix: &str,
        max_size: usize,
        delimiter: char,
    ) -> String {
        let Some(partition) = self.existing_partition(session_id) else {
            return String::new();
        };

        let mut data = partition.data.write();
        if !data.has_pending() {
            return String::new();
        }

        let mut chunk = String::with_capacity(prefix.len().min(max_size) + 256);
        chunk.push_str(prefix);
        let mut moved = 0usize;

        while let Some(len) = data.peek_oldest_len() {
            if chunk.len() + delimiter.len_utf8() + len > max_size {
                break;
            }

            let Some((record, lane)) = data.pop_oldest() else {
                break;
            };

            chunk.push(delimiter);
            chunk.push_str(&record.data);

            match lane {
                Lane::Event => data.sent_events.push(record),
                Lane::Action => data.sent_actions.push(record),
            }
            moved += 1;
        }

        if moved == 0 {
            return String::new();
        }

        chunk
    }

    /// Discards the session's in-transit records after acknowledgment.
    pub fn remove_chunked_data(&self, session_id: i32) {
        let Some(partition) = self.existing_partition(session_id) else {
            return;
        };

        let freed = {
            let mut data = partition.data.write();
            let freed: u64 = data
                .sent_events
                .iter()
                .chain(data.sent_actions.iter())
                .map(CacheRecord::size)
                .sum();
            data.sent_events.clear();
            data.sent_actions.clear();
            data.bytes -= freed;
            freed
        };

        if freed > 0 {
            self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
            self.notify_observers();
        }
    }

    /// Restores the session's in-transit records for a retry.
    ///
    /// Records rejoin the head of their own pending lane, older before
    /// newer; lanes are never merged. Cache size is unchanged.
    pub fn reset_chunked_data(&self, session_id: i32) {
        let Some(partition) = self.existing_partition(session_id) else {
            return;
        };

        let mut data = partition.data.write();
        let restored: Vec<CacheRecord> = data.sent_events.drain(..).collect();
        for record in restored.into_iter().rev() {
            data.events.push_front(record);
        }
        let restored: Vec<CacheRecord> = data.sent_actions.drain(..).collect();
        for record in restored.into_iter().rev() {
            data.actions.push_front(record);
        }
    }

    /// Removes pending records older than `min_age_ms`. In-transit records
    /// are untouched. Returns the number of evicted records.
    pub fn evict_records_by_age(&self, session_id: i32, min_age_ms: i64) -> usize {
        let threshold = self.clock.now_millis() - min_age_ms;
        let Some(partition) = self.existing_partition(session_id) else {
            return 0;
        };

        let mut freed = 0u64;
        let mut evicted = 0usize;
        {
            let mut data = partition.data.write();
            while data
                .events
                .front()
                .is_some_and(|record| record.timestamp < threshold)
            {
                if let Some(record) = data.events.pop_front() {
                    freed += record.size();
                    evicted += 1;
                }
            }
            while data
                .actions
                .front()
                .is_some_and(|record| record.timestamp < threshold)
            {
                if let Some(record) = data.actions.pop_front() {
                    freed += record.size();
                    evicted += 1;
                }
            }
            data.bytes -= freed;
        }

        if evicted > 0 {
            self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
            self.notify_observers();
        }

        evicted
    }

    /// Removes up to `max_to_evict` oldest pending records. In-transit
    /// records are untouched. Returns the number of evicted records.
    pub fn evict_records_by_number(&self, session_id: i32, max_to_evict: usize) -> usize {
        let Some(partition) = self.existing_partition(session_id) else {
            return 0;
        };

        let mut freed = 0u64;
        let mut evicted = 0usize;
        {
            let mut data = partition.data.write();
            while evicted < max_to_evict {
                let Some((record, _)) = data.pop_oldest() else {
                    break;
                };
                freed += record.size();
                evicted += 1;
            }
            data.bytes -= freed;
        }

        if evicted > 0 {
            self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
            self.notify_observers();
        }

        evicted
    }

    /// Whether the session has no pending records.
    pub fn is_empty(&self, session_id: i32) -> bool {
        self.partitions
            .get(&session_id)
            .map_or(true, |partition| !partition.data.read().has_pending())
    }

    /// Total bytes across all partitions, pending and in-transit.
    pub fn num_bytes_in_cache(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Session ids in partition creation order.
    pub fn session_ids(&self) -> Vec<i32> {
        self.insertion_order.lock().clone()
    }
}
