//! Shared test doubles for engine integration tests.
#![allow(dead_code)]

use archiver_engine::channel::{ArchiveChannel, ControllingPv, Sample, SampleBuffer};
use archiver_engine::cluster::{ConnectedPvCount, PeerCountSource};
use archiver_engine::config::ApplianceInfo;
use archiver_engine::error::EngineError;
use archiver_engine::facade::{ArchiveFacade, ArchiveRequest};
use archiver_engine::metadata::MetaInfo;
use archiver_engine::storage::{MemoryStorage, StoragePlugin};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Installs a tracing subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A buffered channel good enough to feed the writer: samples go into a
/// bounded buffer and drain to an optional in-memory destination.
pub struct TestChannel {
    pub name: String,
    pub slot: usize,
    pub buffer: SampleBuffer,
    pub destination: Option<Arc<MemoryStorage>>,
    pub connected: AtomicBool,
    pub seconds_since_search: i64,
    pub needs_meta: AtomicBool,
    pub meta_startups: AtomicUsize,
    pub stopped: AtomicBool,
}

impl TestChannel {
    pub fn connected(name: impl Into<String>, slot: usize) -> Self {
        Self {
            name: name.into(),
            slot,
            buffer: SampleBuffer::new(64),
            destination: None,
            connected: AtomicBool::new(true),
            seconds_since_search: 0,
            needs_meta: AtomicBool::new(false),
            meta_startups: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Disconnected channel whose last search request is `seconds_since_search`
    /// seconds old.
    pub fn stuck(name: impl Into<String>, slot: usize, seconds_since_search: i64) -> Self {
        let channel = Self::connected(name, slot);
        channel.connected.store(false, Ordering::SeqCst);
        Self {
            seconds_since_search,
            ..channel
        }
    }

    pub fn with_destination(mut self, destination: Arc<MemoryStorage>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn push(&self, sample: Sample) {
        self.buffer.push(sample);
    }
}

#[async_trait]
impl ArchiveChannel for TestChannel {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn seconds_elapsed_since_search_request(&self) -> i64 {
        self.seconds_since_search
    }
    fn command_thread_id(&self) -> usize {
        self.slot
    }
    fn meta_channels_need_starting_up(&self) -> bool {
        self.needs_meta.load(Ordering::SeqCst)
    }
    fn start_up_meta_channels(&self) {
        self.meta_startups.fetch_add(1, Ordering::SeqCst);
        self.needs_meta.store(false, Ordering::SeqCst);
    }
    fn shutdown_meta_channels(&self) {}
    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn drain_samples(&self) -> Vec<Sample> {
        self.buffer.drain()
    }
    fn first_destination(&self) -> Option<Arc<dyn StoragePlugin>> {
        self.destination
            .clone()
            .map(|d| d as Arc<dyn StoragePlugin>)
    }
}

/// Controlling PV that remembers being stopped.
pub struct TestControllingPv {
    pub name: String,
    pub stopped: AtomicBool,
}

impl TestControllingPv {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ControllingPv for TestControllingPv {
    fn name(&self) -> &str {
        &self.name
    }
    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Facade recording pause/resume/archive calls.
#[derive(Default)]
pub struct RecordingFacade {
    pub calls: parking_lot::Mutex<Vec<(String, String)>>,
}

impl RecordingFacade {
    pub fn calls_for(&self, pv: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| p == pv)
            .map(|(_, op)| op.clone())
            .collect()
    }

    fn record(&self, pv: &str, op: &str) {
        self.calls.lock().push((pv.to_string(), op.to_string()));
    }
}

#[async_trait]
impl ArchiveFacade for RecordingFacade {
    async fn compute_meta_info(
        &self,
        pv_name: &str,
        extra_fields: &[String],
    ) -> Result<MetaInfo, EngineError> {
        let mut info = MetaInfo::new(pv_name);
        for field in extra_fields {
            info.extra_fields.insert(field.clone(), "0".into());
        }
        Ok(info)
    }
    async fn archive_pv(&self, request: ArchiveRequest) -> Result<(), EngineError> {
        self.record(&request.pv_name, "archive_v3");
        Ok(())
    }
    async fn archive_pv_v4(&self, request: ArchiveRequest) -> Result<(), EngineError> {
        self.record(&request.pv_name, "archive_v4");
        Ok(())
    }
    async fn pause_archiving_pv(&self, pv_name: &str) -> Result<(), EngineError> {
        self.record(pv_name, "pause");
        Ok(())
    }
    async fn resume_archiving_pv(&self, pv_name: &str) -> Result<(), EngineError> {
        self.record(pv_name, "resume");
        Ok(())
    }
}

/// Peer source where every appliance reports the same counts.
pub struct UniformPeers {
    pub count: ConnectedPvCount,
}

#[async_trait]
impl PeerCountSource for UniformPeers {
    async fn connected_pv_count(
        &self,
        _appliance: &ApplianceInfo,
    ) -> Result<ConnectedPvCount, EngineError> {
        Ok(self.count)
    }
}

/// Peer source with no reachable peers.
pub struct UnreachablePeers;

#[async_trait]
impl PeerCountSource for UnreachablePeers {
    async fn connected_pv_count(
        &self,
        appliance: &ApplianceInfo,
    ) -> Result<ConnectedPvCount, EngineError> {
        Err(EngineError::Cluster(format!(
            "no route to {}",
            appliance.identity
        )))
    }
}
