//! Archive engine facade contract.
//!
//! Channel creation, pause/resume and metadata measurement live in the
//! channel layer above this crate. The engine core drives them through this
//! trait: the disconnect monitor pauses and resumes stuck PVs, and the
//! event-bus subscriber starts archiving and launches metadata computations.

use crate::config::{DbrType, SamplingMethod};
use crate::error::EngineError;
use crate::metadata::MetaInfo;
use crate::storage::StoragePlugin;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything needed to begin archiving one PV.
pub struct ArchiveRequest {
    pub pv_name: String,
    pub sampling_method: SamplingMethod,
    pub sampling_period: f32,
    pub seconds_to_buffer: i64,
    pub destination: Arc<dyn StoragePlugin>,
    pub dbr_type: DbrType,
    pub last_known_event: Option<DateTime<Utc>>,
    pub controlling_pv: Option<String>,
    pub archive_fields: Vec<String>,
    pub host_name: Option<String>,
}

#[async_trait]
pub trait ArchiveFacade: Send + Sync {
    /// Measures archival metadata for a PV, sampling `extra_fields` along
    /// with the value.
    async fn compute_meta_info(
        &self,
        pv_name: &str,
        extra_fields: &[String],
    ) -> Result<MetaInfo, EngineError>;

    /// Begins archiving over the classic V3 protocol.
    async fn archive_pv(&self, request: ArchiveRequest) -> Result<(), EngineError>;

    /// Begins archiving over the V4 protocol.
    async fn archive_pv_v4(&self, request: ArchiveRequest) -> Result<(), EngineError>;

    /// Pauses archiving; the channel's protocol resources are released.
    async fn pause_archiving_pv(&self, pv_name: &str) -> Result<(), EngineError>;

    /// Resumes a paused PV, forcing a fresh channel search.
    async fn resume_archiving_pv(&self, pv_name: &str) -> Result<(), EngineError>;
}

impl std::fmt::Debug for ArchiveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveRequest")
            .field("pv_name", &self.pv_name)
            .field("sampling_method", &self.sampling_method)
            .field("sampling_period", &self.sampling_period)
            .field("dbr_type", &self.dbr_type)
            .field("destination", &self.destination.name())
            .finish()
    }
}
