//! The engine context: process-wide state of the sampling/ingest engine.
//!
//! One [`EngineContext`] exists per appliance process. It owns the command
//! slot pool driving protocol I/O, the archive channel registry, the
//! periodic sample writer, the disconnect monitor and the event-bus
//! subscriber, and it tears all of them down in order on shutdown. It is
//! created once by `main`, wrapped in an `Arc` and threaded into every
//! subsystem by reference; there are no hidden globals.
//!
//! Construction wires the collaborators together:
//!
//! ```text
//! ConfigService ──events──▶ subscriber ──▶ ArchiveFacade (channel creation)
//!                                              │
//!     ChannelRegistry ◀── channels register ───┘
//!          │ drains                │ samples via CommandThreadPool
//!     SampleWriter ──▶ StoragePlugin
//!          ▲ fixed rate                 DisconnectChecker ◀─ fixed rate
//!     main Scheduler                    disconnect Scheduler
//! ```

use crate::bus::{BusEvent, EventType};
use crate::channel::ControllingPv;
use crate::cluster::PeerCountSource;
use crate::command::{CommandThread, CommandThreadPool};
use crate::config::{
    ConfigService, COMMAND_THREAD_COUNT_PROPERTY, DEFAULT_COMMAND_THREAD_COUNT,
    DEFAULT_DISCONNECT_CHECK_TIMEOUT_MINUTES, DEFAULT_SAMPLE_BUFFER_CAPACITY_ADJUSTMENT,
    DISCONNECT_CHECK_TIMEOUT_PROPERTY, SAMPLE_BUFFER_CAPACITY_ADJUSTMENT_PROPERTY,
};
use crate::error::EngineError;
use crate::facade::{ArchiveFacade, ArchiveRequest};
use crate::metadata::MetaFetchRegistry;
use crate::monitor::DisconnectChecker;
use crate::protocol::{NativeChannel, ProtocolContext, ProtocolProvider};
use crate::pvnames;
use crate::registry::ChannelRegistry;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::storage;
use crate::writer::SampleWriter;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The disconnect monitor period. There is no installation property for
/// this; the test-only reconfiguration path changes it together with the
/// timeout.
const DEFAULT_DISCONNECT_CHECKER_PERIOD_MINUTES: i64 = 20;

#[derive(Default)]
struct WriterStats {
    total_seconds: f64,
    count: u64,
}

impl WriterStats {
    fn record(&mut self, seconds: f64) {
        self.count += 1;
        self.total_seconds += seconds;
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_seconds / self.count as f64
    }
}

/// Long-lived engine state. See the module docs for the overall shape.
pub struct EngineContext {
    config: Arc<dyn ConfigService>,
    my_identity: String,
    pool: Arc<CommandThreadPool>,
    registry: Arc<ChannelRegistry>,
    controlling_pvs: DashMap<String, Arc<dyn ControllingPv>>,
    writer: Arc<SampleWriter>,
    writer_stats: Arc<parking_lot::Mutex<WriterStats>>,
    /// Main scheduler; carries the writer. Assigned once.
    scheduler: parking_lot::Mutex<Option<Arc<Scheduler>>>,
    /// Dedicated scheduler for the disconnect monitor so writer load cannot
    /// starve connectivity repair.
    disconnect_scheduler: Arc<Scheduler>,
    disconnect_checker: Arc<DisconnectChecker>,
    disconnect_task: parking_lot::Mutex<Option<TaskHandle>>,
    disconnect_timeout_minutes: Arc<AtomicI64>,
    disconnect_period_minutes: AtomicI64,
    write_period: parking_lot::Mutex<f64>,
    write_thread_started: AtomicBool,
    sample_buffer_capacity_adjustment: f64,
    facade: Arc<dyn ArchiveFacade>,
    meta_fetches: Arc<MetaFetchRegistry>,
    subscriber_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl EngineContext {
    /// Builds the engine: spawns the command slot pool (waiting out the
    /// context startup barrier), subscribes to the event bus and starts the
    /// disconnect monitor.
    pub async fn start(
        config: Arc<dyn ConfigService>,
        provider: Arc<dyn ProtocolProvider>,
        facade: Arc<dyn ArchiveFacade>,
        peers: Arc<dyn PeerCountSource>,
    ) -> Result<Arc<Self>> {
        let thread_count = config
            .int_property(COMMAND_THREAD_COUNT_PROPERTY, DEFAULT_COMMAND_THREAD_COUNT)
            .max(1) as usize;
        info!(
            target: "config",
            count = thread_count,
            property = COMMAND_THREAD_COUNT_PROPERTY,
            "Creating command slots"
        );
        let pool = Arc::new(CommandThreadPool::start(thread_count, provider).await);

        let registry = Arc::new(ChannelRegistry::new());
        let writer = Arc::new(SampleWriter::new(registry.clone()));
        let my_identity = config.my_identity();

        let timeout_minutes = config.int_property(
            DISCONNECT_CHECK_TIMEOUT_PROPERTY,
            DEFAULT_DISCONNECT_CHECK_TIMEOUT_MINUTES,
        );
        debug!(target: "config", timeout_minutes, "Disconnect check timeout");
        let disconnect_timeout_minutes = Arc::new(AtomicI64::new(timeout_minutes));

        let sample_buffer_capacity_adjustment = config.float_property(
            SAMPLE_BUFFER_CAPACITY_ADJUSTMENT_PROPERTY,
            DEFAULT_SAMPLE_BUFFER_CAPACITY_ADJUSTMENT,
        );
        debug!(target: "config", adjustment = sample_buffer_capacity_adjustment, "Buffer capacity adjustment");

        let disconnect_checker = Arc::new(DisconnectChecker::new(
            config.clone(),
            registry.clone(),
            facade.clone(),
            peers,
            pool.clone(),
            disconnect_timeout_minutes.clone(),
        ));

        let context = Arc::new(Self {
            config,
            my_identity,
            pool,
            registry,
            controlling_pvs: DashMap::new(),
            writer,
            writer_stats: Arc::new(parking_lot::Mutex::new(WriterStats::default())),
            scheduler: parking_lot::Mutex::new(None),
            disconnect_scheduler: Arc::new(Scheduler::new("disconnect-scheduler")),
            disconnect_checker,
            disconnect_task: parking_lot::Mutex::new(None),
            disconnect_timeout_minutes,
            disconnect_period_minutes: AtomicI64::new(DEFAULT_DISCONNECT_CHECKER_PERIOD_MINUTES),
            write_period: parking_lot::Mutex::new(0.0),
            write_thread_started: AtomicBool::new(false),
            sample_buffer_capacity_adjustment,
            facade,
            meta_fetches: Arc::new(MetaFetchRegistry::new()),
            subscriber_task: parking_lot::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        context.spawn_event_subscriber();
        context.schedule_disconnect_monitor();
        Ok(context)
    }

    // ------------------------------------------------------------------
    // Command slots
    // ------------------------------------------------------------------

    /// Command slot for a PV. Stable: a registered channel (even one looked
    /// up through a field-qualified name) always answers with its recorded
    /// slot; otherwise the base name is hashed.
    pub fn assign_command_thread(&self, pv_name: &str, ioc_host_name: Option<&str>) -> usize {
        self.registry
            .assign_slot(pv_name, ioc_host_name, self.pool.len())
    }

    pub fn command_thread(&self, slot: usize) -> Option<&CommandThread> {
        self.pool.thread(slot)
    }

    pub fn command_thread_count(&self) -> usize {
        self.pool.len()
    }

    /// Whether a callback arriving on `context` belongs to `slot`.
    pub fn does_context_match_thread(&self, context: &dyn ProtocolContext, slot: usize) -> bool {
        self.pool.context_matches_slot(context, slot)
    }

    /// Native channels across every slot whose base name matches the PV's.
    /// Intended for tests; walks every context.
    pub fn all_channels_for_pv(&self, pv_name: &str) -> Vec<(usize, Arc<dyn NativeChannel>)> {
        self.pool.all_channels_for_pv(pv_name)
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    pub fn channel_registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    /// PVs controlling the archiving of other PVs. Stopped and cleared on
    /// shutdown.
    pub fn controlling_pvs(&self) -> &DashMap<String, Arc<dyn ControllingPv>> {
        &self.controlling_pvs
    }

    // ------------------------------------------------------------------
    // Writer
    // ------------------------------------------------------------------

    /// Starts the periodic writer. The requested period is the configured
    /// buffering time; the writer clamps it and the adopted value becomes
    /// the engine's write period. The first flush fires immediately.
    pub fn start_write_thread(&self) {
        if self.write_thread_started.swap(true, Ordering::SeqCst) {
            error!("The write thread has already been started");
            return;
        }
        let requested = self.config.seconds_to_buffer() as f64;
        let actual = self.writer.adopt_period(requested);
        *self.write_period.lock() = actual;

        let scheduler = self.get_scheduler();
        let writer = self.writer.clone();
        let stats = self.writer_stats.clone();
        scheduler.schedule_at_fixed_rate(
            "sample-writer",
            Duration::ZERO,
            Duration::from_millis((actual * 1000.0) as u64),
            move || {
                let writer = writer.clone();
                let stats = stats.clone();
                async move {
                    let elapsed = writer.run_once().await;
                    stats.lock().record(elapsed);
                }
            },
        );
        info!(period_seconds = actual, "Write thread started");
    }

    pub fn writer(&self) -> Arc<SampleWriter> {
        self.writer.clone()
    }

    pub fn write_period(&self) -> f64 {
        *self.write_period.lock()
    }

    pub fn is_write_thread_started(&self) -> bool {
        self.write_thread_started.load(Ordering::SeqCst)
    }

    /// Records the wall-clock seconds one writer flush consumed.
    pub fn set_seconds_consumed_by_writer(&self, seconds: f64) {
        self.writer_stats.lock().record(seconds);
    }

    /// Mean seconds per flush; 0 before the first flush.
    pub fn average_seconds_consumed_by_writer(&self) -> f64 {
        self.writer_stats.lock().average()
    }

    // ------------------------------------------------------------------
    // Schedulers
    // ------------------------------------------------------------------

    /// Main scheduler, created lazily on first use.
    pub fn get_scheduler(&self) -> Arc<Scheduler> {
        self.scheduler
            .lock()
            .get_or_insert_with(|| Arc::new(Scheduler::new("engine-scheduler")))
            .clone()
    }

    /// Installs the main scheduler. May happen only once; a second attempt
    /// is ignored and logged.
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        let mut guard = self.scheduler.lock();
        if guard.is_some() {
            error!("The engine scheduler has already been initialized and cannot be replaced");
            return;
        }
        *guard = Some(scheduler);
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Aborts an in-flight metadata computation for the PV. Returns whether
    /// one was found.
    pub fn abort_compute_meta_info(&self, pv_name: &str) -> bool {
        self.meta_fetches.abort(pv_name)
    }

    // ------------------------------------------------------------------
    // Misc engine knobs
    // ------------------------------------------------------------------

    /// Global multiplier for computed sample buffer capacities. 1.0 leaves
    /// the computation untouched; 1.5 grows every buffer to 150%.
    pub fn sample_buffer_capacity_adjustment(&self) -> f64 {
        self.sample_buffer_capacity_adjustment
    }

    pub fn my_identity(&self) -> &str {
        &self.my_identity
    }

    pub fn config(&self) -> &Arc<dyn ConfigService> {
        &self.config
    }

    /// Reconfigures the disconnect monitor to use `minutes` for both the
    /// stuck timeout and the check period, cancelling and rescheduling the
    /// monitor. For tests only; running servers get no guarantees.
    pub fn set_disconnect_check_timeout_for_testing(&self, minutes: i64) {
        error!("Changing the disconnect timer; this should only happen in tests");
        if let Some(task) = self.disconnect_task.lock().take() {
            task.cancel();
        }
        self.disconnect_timeout_minutes
            .store(minutes, Ordering::SeqCst);
        self.disconnect_period_minutes
            .store(minutes, Ordering::SeqCst);
        self.schedule_disconnect_monitor();
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Ordered, best-effort teardown. Safe to call more than once; only the
    /// first call does the work.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("The archive engine is already shut down");
            return;
        }
        info!("The archive engine will shut down");

        // Main scheduler first: no further writer ticks start, the one in
        // flight finishes.
        let scheduler = self.scheduler.lock().clone();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        for channel in self.registry.snapshot() {
            channel.shutdown_meta_channels();
            channel.stop().await;
        }

        // One last synchronous drain so buffered samples reach storage.
        self.writer.flush_buffer().await;
        self.registry.clear();

        let controlling: Vec<Arc<dyn ControllingPv>> = self
            .controlling_pvs
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for pv in controlling {
            pv.stop().await;
        }
        self.controlling_pvs.clear();

        *self.scheduler.lock() = None;
        self.write_thread_started.store(false, Ordering::SeqCst);

        self.pool.shutdown_all().await;

        // The disconnect scheduler goes down hard; a tick stuck in a peer
        // call must not hold up process exit.
        self.disconnect_scheduler.shutdown_now();
        if let Some(task) = self.subscriber_task.lock().take() {
            task.abort();
        }

        info!("The archive engine has been shut down");
    }

    // ------------------------------------------------------------------
    // Internal wiring
    // ------------------------------------------------------------------

    fn schedule_disconnect_monitor(&self) {
        let period_minutes = self.disconnect_period_minutes.load(Ordering::SeqCst);
        assert!(period_minutes > 0, "disconnect checker period must be positive");
        let period = Duration::from_secs(period_minutes as u64 * 60);
        let checker = self.disconnect_checker.clone();
        let handle = self.disconnect_scheduler.schedule_at_fixed_rate(
            "disconnect-monitor",
            period,
            period,
            move || {
                let checker = checker.clone();
                async move {
                    checker.run_once().await;
                }
            },
        );
        *self.disconnect_task.lock() = Some(handle);
    }

    fn spawn_event_subscriber(&self) {
        let handler = EventHandler {
            config: self.config.clone(),
            facade: self.facade.clone(),
            meta_fetches: self.meta_fetches.clone(),
            my_identity: self.my_identity.clone(),
        };
        let mut rx = self.config.event_bus().subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Event subscriber lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.subscriber_task.lock() = Some(handle);
    }
}

/// Handles engine-addressed bus events. Failures are logged and stay inside
/// the handler; nothing re-enters the bus as an error.
struct EventHandler {
    config: Arc<dyn ConfigService>,
    facade: Arc<dyn ArchiveFacade>,
    meta_fetches: Arc<MetaFetchRegistry>,
    my_identity: String,
}

impl EventHandler {
    async fn handle(&self, event: BusEvent) {
        if !event.is_for(&self.my_identity) {
            debug!(destination = %event.destination, "Skipping event meant for another appliance");
            return;
        }
        match event.event_type {
            EventType::ComputeMetaInfo => self.handle_compute_meta_info(event).await,
            EventType::StartArchivingPV => self.handle_start_archiving(event).await,
            // Confirmations circulating on the bus are not ours to process.
            _ => {}
        }
    }

    async fn handle_compute_meta_info(&self, event: BusEvent) {
        let pv_name = event.pv_name.clone();
        debug!(pv = %pv_name, "ComputeMetaInfo requested");

        let mut extra_fields = self.config.extra_fields();
        if pvnames::field_name(&pv_name).is_some() {
            // A field PV measures just itself.
            debug!(pv = %pv_name, "Not requesting extra fields for a field PV");
            extra_fields = Vec::new();
        }

        let facade = self.facade.clone();
        let bus = self.config.event_bus().clone();
        let my_identity = self.my_identity.clone();
        let pv = pv_name.clone();
        self.meta_fetches.launch(&pv_name, async move {
            match facade.compute_meta_info(&pv, &extra_fields).await {
                Ok(meta_info) => {
                    debug!(pv = %pv, "Completed computing archive metadata");
                    match serde_json::to_string(&meta_info) {
                        Ok(json) => bus.post(
                            BusEvent::new(
                                EventType::MetaInfoFinished,
                                my_identity.clone(),
                                my_identity.clone(),
                                pv.clone(),
                            )
                            .with_payload(json),
                        ),
                        Err(e) => error!(pv = %pv, error = %e, "Failed to serialize metadata"),
                    }
                }
                Err(e) => error!(pv = %pv, error = %e, "Metadata computation failed"),
            }
        });

        self.config.event_bus().post(BusEvent::new(
            EventType::MetaInfoRequested,
            event.source.clone(),
            self.my_identity.clone(),
            pv_name,
        ));
    }

    async fn handle_start_archiving(&self, event: BusEvent) {
        match self.start_archiving_pv(&event.pv_name).await {
            Ok(()) => self.config.event_bus().post(BusEvent::new(
                EventType::StartedArchivingPV,
                event.source.clone(),
                self.my_identity.clone(),
                event.pv_name.clone(),
            )),
            Err(e) => error!(pv = %event.pv_name, error = %e, "Failed to begin archiving PV"),
        }
    }

    async fn start_archiving_pv(&self, pv_name: &str) -> Result<(), EngineError> {
        let Some(type_info) = self.config.type_info_for_pv(pv_name) else {
            // This path runs only after the type info has settled in the
            // cluster; a miss here is a real fault, not a race.
            error!(pv = pv_name, "No type info found for PV");
            return Err(EngineError::MissingTypeInfo(pv_name.to_string()));
        };

        let first_store = type_info.data_stores.first().ok_or_else(|| {
            EngineError::Config(format!("PV '{pv_name}' has no data stores in its policy"))
        })?;
        let destination = storage::parse_storage_plugin(first_store)?;

        info!(
            pv = pv_name,
            method = ?type_info.sampling_method,
            period_seconds = type_info.sampling_period,
            "Archiving PV"
        );
        let request = ArchiveRequest {
            pv_name: pv_name.to_string(),
            sampling_method: type_info.sampling_method,
            sampling_period: type_info.sampling_period,
            seconds_to_buffer: self.config.seconds_to_buffer(),
            destination,
            dbr_type: type_info.dbr_type,
            last_known_event: type_info.last_known_event,
            controlling_pv: type_info.controlling_pv.clone(),
            archive_fields: type_info.archive_fields.clone(),
            host_name: type_info.host_name.clone(),
        };
        if type_info.dbr_type.is_v3() {
            self.facade.archive_pv(request).await
        } else {
            self.facade.archive_pv_v4(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DEST_ALL;
    use crate::channel::{ArchiveChannel, Sample};
    use crate::cluster::ConnectedPvCount;
    use crate::config::{ApplianceInfo, DbrType, MemoryConfigService, PvTypeInfo};
    use crate::metadata::MetaInfo;
    use crate::protocol::LoopbackProvider;
    use crate::registry::stable_slot_for;
    use crate::storage::StoragePlugin;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullFacade;

    #[async_trait]
    impl ArchiveFacade for NullFacade {
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
        async fn archive_pv(&self, _request: ArchiveRequest) -> Result<(), EngineError> {
            Ok(())
        }
        async fn archive_pv_v4(&self, _request: ArchiveRequest) -> Result<(), EngineError> {
            Ok(())
        }
        async fn pause_archiving_pv(&self, _pv_name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn resume_archiving_pv(&self, _pv_name: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct NoPeers;

    #[async_trait]
    impl PeerCountSource for NoPeers {
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

    struct SlotChannel {
        name: String,
        slot: usize,
    }

    #[async_trait]
    impl ArchiveChannel for SlotChannel {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn seconds_elapsed_since_search_request(&self) -> i64 {
            0
        }
        fn command_thread_id(&self) -> usize {
            self.slot
        }
        fn meta_channels_need_starting_up(&self) -> bool {
            false
        }
        fn start_up_meta_channels(&self) {}
        fn shutdown_meta_channels(&self) {}
        async fn stop(&self) {}
        fn drain_samples(&self) -> Vec<Sample> {
            Vec::new()
        }
        fn first_destination(&self) -> Option<Arc<dyn StoragePlugin>> {
            None
        }
    }

    async fn engine_with_config(config: Arc<MemoryConfigService>) -> Arc<EngineContext> {
        EngineContext::start(
            config,
            Arc::new(LoopbackProvider::new()),
            Arc::new(NullFacade),
            Arc::new(NoPeers),
        )
        .await
        .unwrap()
    }

    async fn engine() -> Arc<EngineContext> {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "4");
        engine_with_config(config).await
    }

    #[tokio::test]
    async fn writer_bookkeeping_averages_flush_times() {
        let engine = engine().await;
        assert_eq!(engine.average_seconds_consumed_by_writer(), 0.0);
        engine.set_seconds_consumed_by_writer(0.10);
        engine.set_seconds_consumed_by_writer(0.30);
        engine.set_seconds_consumed_by_writer(0.20);
        let average = engine.average_seconds_consumed_by_writer();
        assert!((average - 0.20).abs() < 1e-9);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn write_thread_startup_adopts_period() {
        let engine = engine().await;
        assert!(!engine.is_write_thread_started());
        engine.start_write_thread();
        assert!(engine.is_write_thread_started());
        assert!(engine.write_period() > 0.0);

        // A second start is refused, not doubled.
        engine.start_write_thread();
        assert!(engine.is_write_thread_started());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn scheduler_is_assigned_only_once() {
        let engine = engine().await;
        let first = Arc::new(Scheduler::new("custom"));
        engine.set_scheduler(first.clone());
        let second = Arc::new(Scheduler::new("imposter"));
        engine.set_scheduler(second);
        assert_eq!(engine.get_scheduler().name(), "custom");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stable_assignment_reuses_registered_slot() {
        let engine = engine().await;
        let hashed = stable_slot_for("ROOM:TEMP", 4);
        assert_eq!(engine.assign_command_thread("ROOM:TEMP", None), hashed);

        // Register the channel on a different slot than the hash picks.
        let forced = (hashed + 1) % 4;
        engine.channel_registry().register(Arc::new(SlotChannel {
            name: "ROOM:TEMP".into(),
            slot: forced,
        }));
        assert_eq!(engine.assign_command_thread("ROOM:TEMP.VAL", None), forced);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn compute_meta_info_posts_request_and_finish() {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "2");
        let engine = engine_with_config(config.clone()).await;
        let mut rx = config.event_bus().subscribe();

        config.event_bus().post(BusEvent::new(
            EventType::ComputeMetaInfo,
            "appliance0",
            "mgmt",
            "sim:x",
        ));

        let mut requested = false;
        let mut finished_payload = None;
        for _ in 0..4 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event expected")
                .unwrap();
            match event.event_type {
                EventType::MetaInfoRequested => {
                    requested = true;
                    assert_eq!(event.destination, "mgmt");
                }
                EventType::MetaInfoFinished => {
                    finished_payload = event.payload.clone();
                    break;
                }
                _ => {}
            }
        }
        assert!(requested);
        let payload = finished_payload.expect("MetaInfoFinished should carry metadata");
        let meta: MetaInfo = serde_json::from_str(&payload).unwrap();
        assert_eq!(meta.pv_name, "sim:x");
        // Extra fields were requested for a non-field PV.
        assert!(!meta.extra_fields.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn compute_meta_info_for_field_pv_skips_extra_fields() {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "2");
        let engine = engine_with_config(config.clone()).await;
        let mut rx = config.event_bus().subscribe();

        config.event_bus().post(BusEvent::new(
            EventType::ComputeMetaInfo,
            DEST_ALL,
            "mgmt",
            "sim:x.HIHI",
        ));

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event expected")
                .unwrap();
            if event.event_type == EventType::MetaInfoFinished {
                let meta: MetaInfo = serde_json::from_str(event.payload.as_deref().unwrap()).unwrap();
                assert!(meta.extra_fields.is_empty());
                break;
            }
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_archiving_confirms_on_the_bus() {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "2");
        let mut info = PvTypeInfo::new("sim:x", DbrType::ScalarDouble);
        info.data_stores = vec!["memory://short-term".into()];
        config.put_type_info(info);
        let engine = engine_with_config(config.clone()).await;
        let mut rx = config.event_bus().subscribe();

        config.event_bus().post(BusEvent::new(
            EventType::StartArchivingPV,
            "appliance0",
            "mgmt",
            "sim:x",
        ));

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event expected")
                .unwrap();
            if event.event_type == EventType::StartedArchivingPV {
                assert_eq!(event.pv_name, "sim:x");
                assert_eq!(event.destination, "mgmt");
                break;
            }
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_archiving_without_type_info_posts_no_confirmation() {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "2");
        let engine = engine_with_config(config.clone()).await;
        let mut rx = config.event_bus().subscribe();

        config.event_bus().post(BusEvent::new(
            EventType::StartArchivingPV,
            "appliance0",
            "mgmt",
            "sim:unknown",
        ));

        // Only the request itself circulates; no confirmation follows.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::StartArchivingPV);
        let followup =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(followup.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn events_for_other_appliances_are_ignored() {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "2");
        let engine = engine_with_config(config.clone()).await;
        let mut rx = config.event_bus().subscribe();

        config.event_bus().post(BusEvent::new(
            EventType::ComputeMetaInfo,
            "appliance7",
            "mgmt",
            "sim:x",
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::ComputeMetaInfo);
        let followup =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(followup.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn buffer_capacity_adjustment_comes_from_properties() {
        let config = Arc::new(MemoryConfigService::new("appliance0"));
        config.set_property(COMMAND_THREAD_COUNT_PROPERTY, "2");
        config.set_property(SAMPLE_BUFFER_CAPACITY_ADJUSTMENT_PROPERTY, "1.5");
        let engine = engine_with_config(config).await;
        assert!((engine.sample_buffer_capacity_adjustment() - 1.5).abs() < f64::EPSILON);
        // No metadata computation is in flight for an unknown PV.
        assert!(!engine.abort_compute_meta_info("sim:nothing"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = engine().await;
        engine.start_write_thread();
        engine.shutdown().await;
        assert!(!engine.is_write_thread_started());
        assert_eq!(engine.channel_registry().len(), 0);
        // A second shutdown is a quiet no-op.
        engine.shutdown().await;
    }
}
