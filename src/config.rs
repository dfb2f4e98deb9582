//! Configuration service contract and PV type information.
//!
//! The engine never reads configuration files itself. Everything it needs
//! comes through the [`ConfigService`] trait: installation properties
//! (string key/values), the typed PV info registry, cluster membership, the
//! process-wide event bus, and the shutting-down flag. Production deployments
//! supply their own backend; [`MemoryConfigService`] is an in-memory
//! implementation good enough to run a whole engine in tests.

use crate::bus::EventBus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

/// Number of command slots driving protocol I/O.
pub const COMMAND_THREAD_COUNT_PROPERTY: &str =
    "org.epics.archiverappliance.engine.epics.commandThreadCount";
pub const DEFAULT_COMMAND_THREAD_COUNT: i64 = 10;

/// Minutes a disconnected channel may sit in search before pause/resume.
pub const DISCONNECT_CHECK_TIMEOUT_PROPERTY: &str =
    "org.epics.archiverappliance.engine.util.EngineContext.disconnectCheckTimeoutInMinutes";
pub const DEFAULT_DISCONNECT_CHECK_TIMEOUT_MINUTES: i64 = 10;

/// Global multiplier applied to computed sample buffer capacities.
pub const SAMPLE_BUFFER_CAPACITY_ADJUSTMENT_PROPERTY: &str =
    "org.epics.archiverappliance.config.PVTypeInfo.sampleBufferCapacityAdjustment";
pub const DEFAULT_SAMPLE_BUFFER_CAPACITY_ADJUSTMENT: f64 = 1.0;

/// Seconds of samples a channel buffers between writer flushes.
pub const SECONDS_TO_BUFFER_PROPERTY: &str =
    "org.epics.archiverappliance.config.PVTypeInfo.secondsToBuffer";
pub const DEFAULT_SECONDS_TO_BUFFER: i64 = 10;

/// DBR type of a PV as recorded in its type info.
///
/// V4 PVs take a different archive-start path than the classic V3 types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbrType {
    ScalarDouble,
    ScalarFloat,
    ScalarInt,
    ScalarShort,
    ScalarByte,
    ScalarString,
    ScalarEnum,
    WaveformDouble,
    WaveformFloat,
    V4Generic,
}

impl DbrType {
    pub fn is_v3(&self) -> bool {
        !matches!(self, DbrType::V4Generic)
    }
}

/// How samples are taken for a PV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMethod {
    Scan,
    Monitor,
    DontArchive,
}

/// Type info for one PV: everything the engine needs to start archiving it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PvTypeInfo {
    pub pv_name: String,
    pub dbr_type: DbrType,
    pub sampling_method: SamplingMethod,
    pub sampling_period: f32,
    /// Storage destination URLs in policy order; the first one is the
    /// destination the engine flushes to.
    pub data_stores: Vec<String>,
    pub paused: bool,
    pub controlling_pv: Option<String>,
    pub archive_fields: Vec<String>,
    pub host_name: Option<String>,
    pub last_known_event: Option<DateTime<Utc>>,
}

impl PvTypeInfo {
    pub fn new(pv_name: impl Into<String>, dbr_type: DbrType) -> Self {
        Self {
            pv_name: pv_name.into(),
            dbr_type,
            sampling_method: SamplingMethod::Monitor,
            sampling_period: 1.0,
            data_stores: Vec::new(),
            paused: false,
            controlling_pv: None,
            archive_fields: Vec::new(),
            host_name: None,
            last_known_event: None,
        }
    }
}

/// One appliance in the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplianceInfo {
    pub identity: String,
    pub engine_url: String,
}

impl ApplianceInfo {
    pub fn new(identity: impl Into<String>, engine_url: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            engine_url: engine_url.into(),
        }
    }
}

/// Contract between the engine and its configuration backend.
pub trait ConfigService: Send + Sync {
    /// Raw installation property lookup.
    fn installation_property(&self, key: &str) -> Option<String>;

    /// Identity of this appliance; events addressed here are for us.
    fn my_identity(&self) -> String;

    /// Every appliance in the cluster, including this one.
    fn appliances_in_cluster(&self) -> Vec<ApplianceInfo>;

    fn type_info_for_pv(&self, pv_name: &str) -> Option<PvTypeInfo>;

    /// Extra fields archived alongside the value (e.g. HIHI, LOLO).
    fn extra_fields(&self) -> Vec<String>;

    fn is_shutting_down(&self) -> bool;

    fn event_bus(&self) -> &EventBus;

    /// Integer property with a fallback default. A malformed value is logged
    /// and the default used; configuration problems must not take the engine
    /// down.
    fn int_property(&self, key: &str, default: i64) -> i64 {
        match self.installation_property(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                error!(target: "config", key, value = %raw, "Malformed integer property, using default {default}");
                default
            }),
            None => default,
        }
    }

    /// Float property with a fallback default.
    fn float_property(&self, key: &str, default: f64) -> f64 {
        match self.installation_property(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                error!(target: "config", key, value = %raw, "Malformed float property, using default {default}");
                default
            }),
            None => default,
        }
    }

    fn seconds_to_buffer(&self) -> i64 {
        self.int_property(SECONDS_TO_BUFFER_PROPERTY, DEFAULT_SECONDS_TO_BUFFER)
    }
}

/// In-memory [`ConfigService`] backend.
///
/// Holds properties, type infos and cluster membership in plain maps. Type
/// infos may be inserted while the engine runs, mirroring how a real backend
/// settles them asynchronously.
pub struct MemoryConfigService {
    identity: String,
    properties: parking_lot::RwLock<HashMap<String, String>>,
    type_infos: dashmap::DashMap<String, PvTypeInfo>,
    appliances: parking_lot::RwLock<Vec<ApplianceInfo>>,
    extra_fields: Vec<String>,
    shutting_down: AtomicBool,
    event_bus: EventBus,
}

impl MemoryConfigService {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            identity: identity.clone(),
            properties: parking_lot::RwLock::new(HashMap::new()),
            type_infos: dashmap::DashMap::new(),
            appliances: parking_lot::RwLock::new(vec![ApplianceInfo::new(
                identity,
                "http://localhost:17665/engine/bpl",
            )]),
            extra_fields: vec!["HIHI".into(), "LOLO".into(), "MDEL".into(), "ADEL".into()],
            shutting_down: AtomicBool::new(false),
            event_bus: EventBus::new(256),
        }
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(key.into(), value.into());
    }

    pub fn put_type_info(&self, info: PvTypeInfo) {
        self.type_infos.insert(info.pv_name.clone(), info);
    }

    pub fn add_appliance(&self, info: ApplianceInfo) {
        self.appliances.write().push(info);
    }

    /// Flips the shutting-down flag; periodic work observes it and stands down.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

impl ConfigService for MemoryConfigService {
    fn installation_property(&self, key: &str) -> Option<String> {
        self.properties.read().get(key).cloned()
    }

    fn my_identity(&self) -> String {
        self.identity.clone()
    }

    fn appliances_in_cluster(&self) -> Vec<ApplianceInfo> {
        self.appliances.read().clone()
    }

    fn type_info_for_pv(&self, pv_name: &str) -> Option<PvTypeInfo> {
        self.type_infos.get(pv_name).map(|e| e.value().clone())
    }

    fn extra_fields(&self) -> Vec<String> {
        self.extra_fields.clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_property_falls_back_on_malformed_value() {
        let config = MemoryConfigService::new("appliance0");
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "not-a-number");
        assert_eq!(
            config.int_property(COMMAND_THREAD_COUNT_PROPERTY, DEFAULT_COMMAND_THREAD_COUNT),
            10
        );

        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "4");
        assert_eq!(config.int_property(COMMAND_THREAD_COUNT_PROPERTY, 10), 4);
    }

    #[test]
    fn missing_property_uses_default() {
        let config = MemoryConfigService::new("appliance0");
        assert_eq!(config.seconds_to_buffer(), DEFAULT_SECONDS_TO_BUFFER);
        assert!(
            (config.float_property(SAMPLE_BUFFER_CAPACITY_ADJUSTMENT_PROPERTY, 1.0) - 1.0).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn dbr_type_protocol_selection() {
        assert!(DbrType::ScalarDouble.is_v3());
        assert!(DbrType::WaveformFloat.is_v3());
        assert!(!DbrType::V4Generic.is_v3());
    }
}
