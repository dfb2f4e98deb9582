//! Archive channel contract and sample types.
//!
//! An archive channel is the per-PV handle owned by the channel layer:
//! subscription, sampling policy and an in-memory sample buffer. The engine
//! core consumes channels only through the [`ArchiveChannel`] trait; the
//! writer drains them, the disconnect monitor inspects their connectivity,
//! and shutdown stops them.

use crate::storage::StoragePlugin;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Value carried by one sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SampleValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Text(String),
}

/// One archived event: a timestamped value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: SampleValue,
}

impl Sample {
    pub fn scalar(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value: SampleValue::Scalar(value),
        }
    }
}

/// Bounded FIFO sample buffer.
///
/// Appends preserve arrival order; when the buffer is full the incoming
/// sample is discarded and counted. Losses on overflow are tolerated by
/// design, the count makes them visible.
pub struct SampleBuffer {
    samples: parking_lot::Mutex<VecDeque<Sample>>,
    capacity: usize,
    dropped: std::sync::atomic::AtomicU64,
}

impl SampleBuffer {
    /// `capacity` is the adjusted capacity, already scaled by the engine's
    /// buffer-capacity adjustment factor. Clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: parking_lot::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn push(&self, sample: Sample) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
        samples.push_back(sample);
    }

    /// Removes and returns all buffered samples in FIFO order.
    pub fn drain(&self) -> Vec<Sample> {
        self.samples.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Capabilities the engine core consumes on a per-PV archive channel.
#[async_trait]
pub trait ArchiveChannel: Send + Sync {
    /// Base PV name; registry keys are always base names.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Seconds since the channel last issued a search request.
    fn seconds_elapsed_since_search_request(&self) -> i64;

    /// Command slot this channel's protocol I/O runs on.
    fn command_thread_id(&self) -> usize;

    /// Whether the auxiliary metadata-field channels still need starting.
    fn meta_channels_need_starting_up(&self) -> bool;

    fn start_up_meta_channels(&self);

    fn shutdown_meta_channels(&self);

    /// Stops the subscription and releases protocol resources.
    async fn stop(&self);

    /// Removes and returns buffered samples in FIFO order.
    fn drain_samples(&self) -> Vec<Sample>;

    /// First storage destination from the PV's policy, if any.
    fn first_destination(&self) -> Option<Arc<dyn StoragePlugin>>;
}

/// A PV whose value gates archiving of other PVs.
#[async_trait]
pub trait ControllingPv: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self);
}
