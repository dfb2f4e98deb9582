//! Archive channel registry and command-slot assignment.
//!
//! The registry is the engine's concurrent map from base PV name to the live
//! [`ArchiveChannel`]. It also owns the stable assignment of PVs to command
//! slots: the first assignment hashes the base name, every later lookup of
//! the same PV (or any of its field variants) reuses the registered
//! channel's slot so a reconnecting channel lands on the same protocol
//! context.

use crate::channel::ArchiveChannel;
use crate::pvnames;
use dashmap::DashMap;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::debug;
use twox_hash::XxHash64;

/// Deterministic slot for a base name. Seeded xxhash so the mapping survives
/// process restarts and is identical on every platform.
pub fn stable_slot_for(base_name: &str, slot_count: usize) -> usize {
    if slot_count == 0 {
        return 0;
    }
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(base_name.as_bytes());
    (hasher.finish() % slot_count as u64) as usize
}

/// Concurrent base-name → channel map.
///
/// Keys are always base names; field-qualified names never appear. Readers
/// and writers may overlap freely, entries are never observed half-written.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<dyn ArchiveChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel under the base name of its PV.
    pub fn register(&self, channel: Arc<dyn ArchiveChannel>) {
        let key = pvnames::base_name(channel.name()).to_string();
        self.channels.insert(key, channel);
    }

    /// Looks up by any PV name; the field suffix is ignored.
    pub fn get(&self, pv_name: &str) -> Option<Arc<dyn ArchiveChannel>> {
        self.channels
            .get(pvnames::base_name(pv_name))
            .map(|e| e.value().clone())
    }

    pub fn remove(&self, pv_name: &str) -> Option<Arc<dyn ArchiveChannel>> {
        self.channels
            .remove(pvnames::base_name(pv_name))
            .map(|(_, c)| c)
    }

    /// Snapshot of all registered channels. No ordering guarantee.
    pub fn snapshot(&self) -> Vec<Arc<dyn ArchiveChannel>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&self) {
        self.channels.clear();
    }

    /// Command slot for a PV. A registered channel always wins over the
    /// hash; `_ioc_host_name` is accepted for signature compatibility with
    /// callers that track the IOC but takes no part in the assignment.
    pub fn assign_slot(&self, pv_name: &str, _ioc_host_name: Option<&str>, slot_count: usize) -> usize {
        let base = pvnames::base_name(pv_name);
        if let Some(channel) = self.channels.get(base) {
            if pv_name == base {
                // Expected for metachannels, unusual for main channels.
                debug!(pv = pv_name, "Channel already registered, reusing its command slot");
            }
            return channel.command_thread_id();
        }
        stable_slot_for(base, slot_count)
    }
}
