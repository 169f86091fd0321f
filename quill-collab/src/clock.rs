//! Per-device logical counters for causal merge.
//!
//! Every edit carries a snapshot of its originating device's clock.
//! Documents merge those snapshots pointwise, so the document clock is
//! always the least upper bound of every edit it has observed.

use std::collections::BTreeMap;

/// Mapping of device id → monotonically non-decreasing counter.
///
/// A device's own counter only moves via [`VectorClock::increment`];
/// merging a remote clock never decreases any entry. `BTreeMap` keeps
/// iteration and serialization order deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Bump the counter owned by `device_id` and return a snapshot of
    /// the full clock, suitable for stamping onto a new operation.
    ///
    /// Callers must only increment on behalf of the device that owns
    /// the entry; remote progress arrives through [`merge`](Self::merge).
    pub fn increment(&mut self, device_id: &str) -> BTreeMap<String, u64> {
        let counter = self.entries.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
        self.entries.clone()
    }

    /// Pointwise-max merge of a remote clock snapshot.
    ///
    /// Commutative and idempotent: merging the same snapshot twice is a
    /// no-op, and merge order never changes the result.
    pub fn merge(&mut self, other: &BTreeMap<String, u64>) {
        for (device, &counter) in other {
            let entry = self.entries.entry(device.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Counter for one device; absent devices read as 0.
    pub fn get(&self, device_id: &str) -> u64 {
        self.entries.get(device_id).copied().unwrap_or(0)
    }

    /// Immutable copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.entries.clone()
    }

    /// Whether the clock has observed any progress at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
