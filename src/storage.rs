//! Storage plugin contract and built-in destinations.
//!
//! Flushed event streams land in pluggable storage. A destination is
//! described by a URL in the PV's type info; [`parse_storage_plugin`] turns
//! the URL into a live plugin. Real deployments register protocol-buffer or
//! database backends; the built-ins here cover in-memory capture (tests,
//! smoke deployments) and a discard sink.

use crate::channel::Sample;
use crate::error::EngineError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// A destination for flushed event streams.
#[async_trait]
pub trait StoragePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Appends samples for one PV. Order within the slice is the buffer's
    /// FIFO order and must be preserved.
    async fn append(&self, pv_name: &str, samples: &[Sample]) -> Result<(), EngineError>;
}

/// Parses a storage plugin URL into a live plugin.
///
/// Supported schemes: `memory://<name>` and `blackhole://`.
pub fn parse_storage_plugin(url: &str) -> Result<Arc<dyn StoragePlugin>, EngineError> {
    if let Some(name) = url.strip_prefix("memory://") {
        return Ok(Arc::new(MemoryStorage::new(name)));
    }
    if url.starts_with("blackhole://") {
        return Ok(Arc::new(BlackholeStorage));
    }
    Err(EngineError::UnknownStoragePlugin(url.to_string()))
}

/// Keeps every appended sample in memory, keyed by PV name.
pub struct MemoryStorage {
    name: String,
    events: DashMap<String, Vec<Sample>>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: DashMap::new(),
        }
    }

    pub fn event_count(&self, pv_name: &str) -> usize {
        self.events.get(pv_name).map(|e| e.len()).unwrap_or(0)
    }

    pub fn events_for(&self, pv_name: &str) -> Vec<Sample> {
        self.events
            .get(pv_name)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoragePlugin for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, pv_name: &str, samples: &[Sample]) -> Result<(), EngineError> {
        self.events
            .entry(pv_name.to_string())
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }
}

/// Discards everything. Useful as a placeholder destination.
pub struct BlackholeStorage;

#[async_trait]
impl StoragePlugin for BlackholeStorage {
    fn name(&self) -> &str {
        "blackhole"
    }

    async fn append(&self, _pv_name: &str, _samples: &[Sample]) -> Result<(), EngineError> {
        Ok(())
    }
}
