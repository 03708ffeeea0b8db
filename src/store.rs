//! The data-node storage engine (C5): key/value table, LRU time index,
//! approximate-RAM-bounded eviction, and rebalance/migration.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;

use crate::connection;
use crate::node::NodeStatus;
use crate::ring::Ring;
use crate::wire::{format_multiplier, put_string, RequestKind};

/// Lower and upper clamp on the sampled RAM multiplier (spec §4.5).
const RAM_MULTIPLIER_MIN: f64 = 1.0;
const RAM_MULTIPLIER_MAX: f64 = 3.0;
/// Used when either operand of the multiplier estimate is zero.
const RAM_MULTIPLIER_FALLBACK: f64 = 1.5;

struct Inner {
    data_by_key: HashMap<String, Vec<u8>>,
    key_put_times: HashMap<String, i64>,
    /// Ordered by put time so the earliest non-empty bucket is always the
    /// LRU eviction candidate. A `BTreeMap` gives this for free; spec §9
    /// requires an ordered structure here specifically.
    keys_by_time: BTreeMap<i64, Vec<String>>,
    total_data_bytes: i64,
    latest_ram_bytes: i64,
    ram_multiplier: f64,
}

impl Inner {
    fn new() -> Self {
        Inner {
            data_by_key: HashMap::new(),
            key_put_times: HashMap::new(),
            keys_by_time: BTreeMap::new(),
            total_data_bytes: 0,
            latest_ram_bytes: 0,
            ram_multiplier: RAM_MULTIPLIER_FALLBACK,
        }
    }

    fn approx_ram(&self) -> f64 {
        self.total_data_bytes as f64 * self.ram_multiplier
    }

    /// Removes one key entirely from all three indexes, returning its size
    /// in bytes if it existed.
    fn remove_key(&mut self, key: &str) -> Option<i64> {
        let value = self.data_by_key.remove(key)?;
        let size = value.len() as i64;
        self.total_data_bytes -= size;

        if let Some(put_time) = self.key_put_times.remove(key) {
            if let Some(bucket) = self.keys_by_time.get_mut(&put_time) {
                bucket.retain(|k| k != key);
                if bucket.is_empty() {
                    self.keys_by_time.remove(&put_time);
                }
            }
        }

        Some(size)
    }

    /// Evicts entries, earliest-put-time-bucket first, until admitting an
    /// entry of `incoming_size` bytes would not exceed `max_bytes` under the
    /// approximate-RAM model (spec §4.5).
    fn evict_for_incoming(&mut self, incoming_size: i64, max_bytes: i64) {
        let approx_entry = incoming_size as f64 * self.ram_multiplier;

        while self.approx_ram() + approx_entry > max_bytes as f64 {
            let Some((&earliest_time, _)) = self.keys_by_time.iter().next() else {
                break;
            };
            let victim = {
                let bucket = self.keys_by_time.get(&earliest_time).unwrap();
                bucket.first().cloned()
            };
            let Some(victim) = victim else { break };
            self.remove_key(&victim);
        }
    }
}

/// Snapshot returned by `GetStats` (spec §4.5, §6).
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub num_objects: i32,
    pub total_data_bytes: i64,
    pub latest_ram_bytes: i64,
    pub ram_multiplier: f64,
    pub max_bytes: i64,
    pub status: NodeStatus,
}

impl StatsSnapshot {
    /// Wire encoding for a `GetStats` response: numObjects, totalDataBytes,
    /// latestRamBytes, the multiplier as a two-decimal string, maxBytes, and
    /// the status byte, in that order (spec §6).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32(self.num_objects);
        buf.put_i64(self.total_data_bytes);
        buf.put_i64(self.latest_ram_bytes);
        put_string(&mut buf, &format_multiplier(self.ram_multiplier));
        buf.put_i64(self.max_bytes);
        buf.put_u8(self.status.to_wire());
        buf.to_vec()
    }
}

/// Milliseconds since the Unix epoch, used as the `put_time` ordering key
/// for eviction (spec §4.5).
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Reads this process's resident set size from `/proc/self/status`, used to
/// feed the ~5s RAM sampler (spec §4.5). Returns 0 if unavailable (e.g. on a
/// non-Linux host), which falls back to the fixed multiplier.
pub fn sample_process_rss_bytes() -> i64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(kb) = digits.parse::<i64>() {
                return kb * 1024;
            }
        }
    }
    0
}

/// The per-data-node key/value store. All mutation is linearised through a
/// single reader/writer lock: many concurrent readers for `get`/`stats`, one
/// exclusive writer for `put`/`delete`/eviction/rebalance (spec §5).
pub struct Store {
    inner: RwLock<Inner>,
    /// A data node doesn't know its own capacity until the master's pushed
    /// ring tells it (the static `Node` line lives in the master's config,
    /// not the data node's), so this starts at whatever the caller had on
    /// hand and is corrected once the first ring arrives.
    max_bytes: std::sync::atomic::AtomicI64,
    pub status: RwLock<NodeStatus>,
}

impl Store {
    pub fn new(max_bytes: i64) -> Self {
        Store {
            inner: RwLock::new(Inner::new()),
            max_bytes: std::sync::atomic::AtomicI64::new(max_bytes),
            status: RwLock::new(NodeStatus::Down),
        }
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_max_bytes(&self, max_bytes: i64) {
        self.max_bytes.store(max_bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().data_by_key.get(key).cloned()
    }

    /// Inserts or replaces a key's value, evicting LRU entries first if
    /// needed to stay within the approximate RAM bound (spec §4.5).
    pub fn put(&self, key: &str, value: Vec<u8>, put_time: i64) {
        let mut inner = self.inner.write();

        // An overwrite removes the old entry from all three indexes first,
        // so eviction below only ever has to make room for the new value.
        if let Some(old) = inner.data_by_key.remove(key) {
            inner.total_data_bytes -= old.len() as i64;
        }
        if let Some(old_time) = inner.key_put_times.remove(key) {
            if let Some(bucket) = inner.keys_by_time.get_mut(&old_time) {
                bucket.retain(|k| k != key);
                if bucket.is_empty() {
                    inner.keys_by_time.remove(&old_time);
                }
            }
        }

        let max_bytes = self.max_bytes();
        inner.evict_for_incoming(value.len() as i64, max_bytes);

        inner.total_data_bytes += value.len() as i64;
        inner.data_by_key.insert(key.to_string(), value);
        inner.key_put_times.insert(key.to_string(), put_time);
        inner
            .keys_by_time
            .entry(put_time)
            .or_default()
            .push(key.to_string());
    }

    /// Removes a key. Returns `true` whether or not it existed beforehand --
    /// the caller acknowledges the delete intent either way (spec §4.5).
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        inner.remove_key(key).is_some()
    }

    /// Empties the store (spec `FireSale`).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.data_by_key.clear();
        inner.key_put_times.clear();
        inner.keys_by_time.clear();
        inner.total_data_bytes = 0;
    }

    pub fn stats(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        StatsSnapshot {
            num_objects: inner.data_by_key.len() as i32,
            total_data_bytes: inner.total_data_bytes,
            latest_ram_bytes: inner.latest_ram_bytes,
            ram_multiplier: inner.ram_multiplier,
            max_bytes: self.max_bytes(),
            status: *self.status.read(),
        }
    }

    /// Snapshot of every key currently stored, used by `rebalance` so the
    /// scan doesn't hold the lock for its whole (potentially slow, network
    /// bound) duration.
    pub fn snapshot_keys(&self) -> Vec<String> {
        self.inner.read().data_by_key.keys().cloned().collect()
    }

    /// Takes a key's value out of the store atomically -- used by rebalance
    /// to hand a key to its rightful owner exactly once.
    pub fn take(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.write();
        let value = inner.data_by_key.get(key).cloned();
        if value.is_some() {
            inner.remove_key(key);
        }
        value
    }

    /// Updates the RAM sample and re-derives the clamped multiplier (spec
    /// §4.5's ~5s background sampler).
    pub fn record_ram_sample(&self, latest_ram_bytes: i64) {
        let mut inner = self.inner.write();
        inner.latest_ram_bytes = latest_ram_bytes;

        let total = inner.total_data_bytes;
        inner.ram_multiplier = if latest_ram_bytes == 0 || total == 0 {
            RAM_MULTIPLIER_FALLBACK
        } else {
            (latest_ram_bytes as f64 / total as f64).clamp(RAM_MULTIPLIER_MIN, RAM_MULTIPLIER_MAX)
        };
    }
}

/// Scans every locally stored key and forwards any that this node no longer
/// owns under `ring` to their rightful owner, deleting the local copy once
/// the forward succeeds. Best-effort: a single failed forward is logged and
/// the scan continues (spec §4.5 "Rebalance").
pub async fn rebalance(store: &Store, ring: &Ring, self_name: &str) {
    let keys = store.snapshot_keys();

    for key in keys {
        let Some(owner) = ring.owner_for_key(&key) else {
            continue;
        };
        if owner.canonical_name() == self_name {
            continue;
        }

        let Some(value) = store.take(&key) else {
            continue;
        };

        let mut payload = bytes::BytesMut::new();
        crate::wire::put_bytes(&mut payload, key.as_bytes());
        crate::wire::put_bytes(&mut payload, &value);

        let result = connection::request(
            &owner.host,
            owner.port,
            RequestKind::PutObject.to_u8(),
            &payload,
        )
        .await;

        if let Err(err) = result {
            tracing::warn!(
                key = %key,
                owner = %owner.canonical_name(),
                error = %err,
                "rebalance: failed to migrate key, dropping it locally"
            );
        } else {
            tracing::debug!(key = %key, owner = %owner.canonical_name(), "rebalance: migrated key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = Store::new(1024 * 1024);
        store.put("abc", b"Hello, World!".to_vec(), 1);
        assert_eq!(store.get("abc"), Some(b"Hello, World!".to_vec()));
    }

    #[test]
    fn delete_then_get_is_missing() {
        let store = Store::new(1024 * 1024);
        store.put("abc", b"value".to_vec(), 1);
        assert!(store.delete("abc"));
        assert_eq!(store.get("abc"), None);
    }

    #[test]
    fn delete_of_absent_key_still_reports_ok() {
        let store = Store::new(1024 * 1024);
        assert!(!store.delete("never-existed"));
    }

    #[test]
    fn keys_are_independent() {
        let store = Store::new(1024 * 1024);
        store.put("k1", b"v1".to_vec(), 1);
        store.put("k2", b"v2".to_vec(), 2);
        store.delete("k1");

        assert_eq!(store.get("k1"), None);
        assert_eq!(store.get("k2"), Some(b"v2".to_vec()));
    }

    #[test]
    fn eviction_keeps_approx_ram_within_bound() {
        let max_bytes = 1000i64;
        let store = Store::new(max_bytes);
        store.record_ram_sample(0); // forces the 1.5 fallback multiplier

        for i in 0..50 {
            let value = vec![0u8; 50];
            store.put(&format!("key-{}", i), value, i as i64);

            let stats = store.stats();
            let approx = stats.total_data_bytes as f64 * stats.ram_multiplier;
            assert!(
                approx <= max_bytes as f64,
                "approx RAM {} exceeded max_bytes {} after put {}",
                approx,
                max_bytes,
                i
            );
        }
    }

    #[test]
    fn eviction_is_oldest_first() {
        let store = Store::new(220);
        store.record_ram_sample(0); // 1.5x fallback multiplier
        store.put("first", vec![0u8; 50], 1);
        store.put("second", vec![0u8; 50], 2);
        // Admitting a third 50-byte entry would push approx RAM over 220
        // (150 existing * 1.5 = 225 already at the edge), so the oldest
        // ("first") should be evicted to make room.
        store.put("third", vec![0u8; 50], 3);

        assert_eq!(store.get("first"), None);
        assert_eq!(store.get("second"), Some(vec![0u8; 50]));
        assert_eq!(store.get("third"), Some(vec![0u8; 50]));
    }

    #[test]
    fn clear_empties_everything() {
        let store = Store::new(1024);
        store.put("a", vec![1, 2, 3], 1);
        store.put("b", vec![4, 5], 2);
        store.clear();

        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), None);
        assert_eq!(store.stats().num_objects, 0);
        assert_eq!(store.stats().total_data_bytes, 0);
    }
}
