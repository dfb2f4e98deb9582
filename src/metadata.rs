//! Archival metadata and in-flight computation tracking.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::DbrType;

/// Metadata gathered for a PV before archiving begins: display limits,
/// units, measured event/storage rates and any extra fields sampled during
/// the measurement window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    pub pv_name: String,
    pub dbr_type: Option<DbrType>,
    pub host_name: Option<String>,
    pub unit: Option<String>,
    pub precision: Option<i32>,
    pub lower_display_limit: Option<f64>,
    pub upper_display_limit: Option<f64>,
    /// Events per second observed during the measurement window.
    pub event_rate: f64,
    /// Bytes per second observed during the measurement window.
    pub storage_rate: f64,
    pub event_count: u64,
    pub extra_fields: HashMap<String, String>,
}

impl MetaInfo {
    pub fn new(pv_name: impl Into<String>) -> Self {
        Self {
            pv_name: pv_name.into(),
            ..Default::default()
        }
    }
}

/// Tracks in-flight metadata computations so they can be aborted per PV.
///
/// Each computation runs in its own task; completion removes the entry,
/// abort cancels the task. Entries carry a generation stamp so a completing
/// computation never deletes a newer one launched under the same PV.
#[derive(Default)]
pub struct MetaFetchRegistry {
    inflight: Arc<DashMap<String, (u64, JoinHandle<()>)>>,
    next_generation: AtomicU64,
}

impl MetaFetchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches a computation for `pv_name`. A second launch for the same PV
    /// replaces (and cancels) the first.
    pub fn launch<F>(&self, pv_name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let inflight = self.inflight.clone();
        let pv = pv_name.to_string();
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            // Wait until the launcher has recorded us, so completion cannot
            // race the insert.
            let _ = registered_rx.await;
            fut.await;
            inflight.remove_if(&pv, |_, (gen, _)| *gen == generation);
        });
        if let Some((_, previous)) = self.inflight.insert(pv_name.to_string(), (generation, handle))
        {
            debug!(pv = pv_name, "Replacing in-flight metadata computation");
            previous.abort();
        }
        let _ = registered_tx.send(());
    }

    /// Aborts the in-flight computation for `pv_name`. Returns whether one
    /// was found.
    pub fn abort(&self, pv_name: &str) -> bool {
        match self.inflight.remove(pv_name) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}
