//! Disconnect/reconnect monitor and staged metachannel startup.
//!
//! Channel access is supposed to reconnect dropped channels on its own, but
//! occasionally a channel sits in search forever. The monitor walks the
//! registry periodically, converts long-stuck channels into a pause/resume
//! (forcing a fresh search), and once the cluster is mostly connected starts
//! metachannels in batches.

use crate::cluster::PeerCountSource;
use crate::command::CommandThreadPool;
use crate::config::ConfigService;
use crate::facade::ArchiveFacade;
use crate::registry::ChannelRegistry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Above this local/peer disconnected percentage, metachannel startup waits
/// for the cluster to settle.
pub const MAX_DISCONNECTED_PERCENT_BEFORE_STARTING_METACHANNELS: f64 = 5.0;

/// Metachannel startups per monitor tick.
pub const METACHANNELS_TO_START_AT_A_TIME: usize = 10_000;

/// Wait between pausing a stuck PV and resuming it.
const PAUSE_RESUME_SLEEP: Duration = Duration::from_secs(1);

/// One periodic connectivity-repair pass over the channel registry.
pub struct DisconnectChecker {
    config: Arc<dyn ConfigService>,
    registry: Arc<ChannelRegistry>,
    facade: Arc<dyn ArchiveFacade>,
    peers: Arc<dyn PeerCountSource>,
    pool: Arc<CommandThreadPool>,
    /// Minutes before a disconnected channel counts as stuck. Shared with
    /// the engine context so the test-only reconfiguration path can adjust
    /// it; zero or negative disables pause/resume entirely.
    timeout_minutes: Arc<AtomicI64>,
}

impl DisconnectChecker {
    pub fn new(
        config: Arc<dyn ConfigService>,
        registry: Arc<ChannelRegistry>,
        facade: Arc<dyn ArchiveFacade>,
        peers: Arc<dyn PeerCountSource>,
        pool: Arc<CommandThreadPool>,
        timeout_minutes: Arc<AtomicI64>,
    ) -> Self {
        Self {
            config,
            registry,
            facade,
            peers,
            pool,
            timeout_minutes,
        }
    }

    /// One monitor tick. Never propagates failure; every fallible step logs
    /// and moves on so one bad PV or peer cannot stall connectivity repair.
    pub async fn run_once(&self) {
        if self.config.is_shutting_down() {
            debug!("Skipping disconnect checks, the system is shutting down");
            return;
        }
        debug!("Checking for disconnected channels");

        let timeout_seconds = self.timeout_minutes.load(Ordering::Relaxed) * 60;
        let total_channels = self.registry.len();
        let mut disconnected_stuck: Vec<String> = Vec::new();
        let mut needs_meta: Vec<String> = Vec::new();

        for channel in self.registry.snapshot() {
            if !channel.is_connected() {
                let elapsed = channel.seconds_elapsed_since_search_request();
                if timeout_seconds > 0 && elapsed > timeout_seconds {
                    disconnected_stuck.push(channel.name().to_string());
                } else if timeout_seconds > 0 {
                    debug!(
                        pv = channel.name(),
                        elapsed, timeout_seconds, "Disconnected but not yet due for pause/resume"
                    );
                } else {
                    debug!(
                        pv = channel.name(),
                        "Pause/resume on disconnect is turned off, leaving PV to its own search"
                    );
                }
            } else if channel.meta_channels_need_starting_up() {
                needs_meta.push(channel.name().to_string());
            }
        }

        let disconnected_count = disconnected_stuck.len();
        debug!(
            disconnected = disconnected_count,
            meta = needs_meta.len(),
            "Disconnect check pass complete"
        );

        for pv in &disconnected_stuck {
            self.repair_stuck_pv(pv).await;
        }

        self.start_metachannels_if_cluster_settled(total_channels, disconnected_count, needs_meta)
            .await;
    }

    /// Pause/resume one stuck PV. Retried on every tick until it connects.
    async fn repair_stuck_pv(&self, pv_name: &str) {
        let Some(type_info) = self.config.type_info_for_pv(pv_name) else {
            debug!(pv = pv_name, "Not pausing and resuming a deleted PV");
            return;
        };
        if type_info.paused {
            debug!(pv = pv_name, "Not pausing and resuming an already paused PV");
            return;
        }
        warn!(pv = pv_name, "Pausing and resuming the PV");
        if let Err(e) = self.pause_and_resume(pv_name).await {
            error!(pv = pv_name, error = %e, "Failed pausing and resuming PV on disconnect");
        }
    }

    async fn pause_and_resume(&self, pv_name: &str) -> Result<(), crate::error::EngineError> {
        self.facade.pause_archiving_pv(pv_name).await?;
        tokio::time::sleep(PAUSE_RESUME_SLEEP).await;
        let stragglers = self.pool.all_channels_for_pv(pv_name);
        if !stragglers.is_empty() {
            warn!(
                pv = pv_name,
                count = stragglers.len(),
                "Native channels still present even after pausing"
            );
        }
        self.facade.resume_archiving_pv(pv_name).await?;
        debug!(pv = pv_name, "Successfully paused and resumed the PV");
        Ok(())
    }

    /// Metachannels come up only once both this appliance and every
    /// responding peer are below the disconnected threshold, and then only a
    /// batch at a time.
    async fn start_metachannels_if_cluster_settled(
        &self,
        total_channels: usize,
        disconnected_count: usize,
        needs_meta: Vec<String>,
    ) {
        if needs_meta.is_empty() {
            return;
        }
        let local_percent = disconnected_count as f64 * 100.0 / total_channels as f64;
        if local_percent >= MAX_DISCONNECTED_PERCENT_BEFORE_STARTING_METACHANNELS {
            info!(
                local_percent,
                "Too many local channels disconnected, not starting metachannels this tick"
            );
            return;
        }

        let my_identity = self.config.my_identity();
        for appliance in self.config.appliances_in_cluster() {
            if appliance.identity == my_identity {
                continue;
            }
            if self.config.is_shutting_down() {
                return;
            }
            match self.peers.connected_pv_count(&appliance).await {
                Ok(count) => {
                    if count.disconnected_percent()
                        < MAX_DISCONNECTED_PERCENT_BEFORE_STARTING_METACHANNELS
                    {
                        debug!(
                            appliance = %appliance.identity,
                            "Appliance has connected to most of its channels"
                        );
                    } else {
                        info!(
                            appliance = %appliance.identity,
                            "Appliance has not connected to most of its channels, skipping metachannel startup"
                        );
                        return;
                    }
                }
                // An unreachable peer is unknown, not a veto.
                Err(e) => {
                    error!(
                        appliance = %appliance.identity,
                        url = %appliance.engine_url,
                        error = %e,
                        "Failed to check disconnected PV count on appliance"
                    );
                }
            }
        }

        let mut started = 0usize;
        for pv_name in needs_meta.iter().take(METACHANNELS_TO_START_AT_A_TIME) {
            if let Some(channel) = self.registry.get(pv_name) {
                debug!(pv = %pv_name, "Starting metachannels");
                channel.start_up_meta_channels();
                started += 1;
            }
        }
        debug!(started, "Metachannel startup batch complete");
    }
}
