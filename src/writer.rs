//! Periodic sample writer.
//!
//! Every write period the writer walks the channel registry, drains each
//! channel's sample buffer and appends the events to the channel's first
//! storage destination. A channel with no destination or a failing
//! destination is logged and skipped; the tick always finishes the walk.

use crate::registry::ChannelRegistry;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Floor for the write period; the requested buffering time is also rounded
/// up to whole seconds so the scheduler period is exact in milliseconds.
pub const MIN_WRITE_PERIOD_SECONDS: f64 = 1.0;

/// Drains sample buffers to storage.
pub struct SampleWriter {
    registry: Arc<ChannelRegistry>,
    period_seconds: parking_lot::Mutex<f64>,
}

impl SampleWriter {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            period_seconds: parking_lot::Mutex::new(MIN_WRITE_PERIOD_SECONDS),
        }
    }

    /// Adopts a requested write period, clamping and rounding to what the
    /// writer actually runs at. Returns the adopted period in seconds.
    pub fn adopt_period(&self, requested_seconds: f64) -> f64 {
        let actual = requested_seconds.max(MIN_WRITE_PERIOD_SECONDS).ceil();
        *self.period_seconds.lock() = actual;
        actual
    }

    pub fn period_seconds(&self) -> f64 {
        *self.period_seconds.lock()
    }

    /// One writer tick. Returns the wall-clock seconds consumed.
    pub async fn run_once(&self) -> f64 {
        let started = Instant::now();
        let channels = self.registry.snapshot();
        for channel in channels {
            let samples = channel.drain_samples();
            if samples.is_empty() {
                continue;
            }
            match channel.first_destination() {
                Some(destination) => {
                    if let Err(e) = destination.append(channel.name(), &samples).await {
                        // Buffered events for this tick are lost; the next
                        // tick retries with fresh samples.
                        error!(pv = channel.name(), store = destination.name(), error = %e,
                            "Failed to flush samples to storage");
                    }
                }
                None => {
                    debug!(pv = channel.name(), "Channel has no storage destination, discarding samples");
                }
            }
        }
        started.elapsed().as_secs_f64()
    }

    /// Synchronous full drain, used during shutdown.
    pub async fn flush_buffer(&self) {
        let _ = self.run_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ArchiveChannel, Sample, SampleBuffer, SampleValue};
    use crate::storage::{MemoryStorage, StoragePlugin};
    use async_trait::async_trait;
    use chrono::Utc;

    struct BufferedChannel {
        name: String,
        buffer: SampleBuffer,
        destination: Option<Arc<MemoryStorage>>,
    }

    #[async_trait]
    impl ArchiveChannel for BufferedChannel {
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
            0
        }
        fn meta_channels_need_starting_up(&self) -> bool {
            false
        }
        fn start_up_meta_channels(&self) {}
        fn shutdown_meta_channels(&self) {}
        async fn stop(&self) {}
        fn drain_samples(&self) -> Vec<Sample> {
            self.buffer.drain()
        }
        fn first_destination(&self) -> Option<Arc<dyn StoragePlugin>> {
            self.destination
                .clone()
                .map(|d| d as Arc<dyn StoragePlugin>)
        }
    }

    #[tokio::test]
    async fn drains_buffers_in_fifo_order() {
        let registry = Arc::new(ChannelRegistry::new());
        let store = Arc::new(MemoryStorage::new("short-term"));
        let channel = Arc::new(BufferedChannel {
            name: "sim:x".into(),
            buffer: SampleBuffer::new(16),
            destination: Some(store.clone()),
        });
        for v in 0..5 {
            channel.buffer.push(Sample::scalar(Utc::now(), v as f64));
        }
        registry.register(channel.clone());

        let writer = SampleWriter::new(registry);
        let elapsed = writer.run_once().await;
        assert!(elapsed >= 0.0);

        let stored = store.events_for("sim:x");
        assert_eq!(stored.len(), 5);
        for (i, s) in stored.iter().enumerate() {
            match s.value {
                SampleValue::Scalar(v) => assert_eq!(v, i as f64),
                _ => panic!("expected scalar"),
            }
        }
        // Buffer is empty after the drain.
        assert!(channel.buffer.is_empty());
    }

    #[tokio::test]
    async fn channel_without_destination_is_skipped() {
        let registry = Arc::new(ChannelRegistry::new());
        let channel = Arc::new(BufferedChannel {
            name: "sim:orphan".into(),
            buffer: SampleBuffer::new(4),
            destination: None,
        });
        channel.buffer.push(Sample::scalar(Utc::now(), 1.0));
        registry.register(channel);

        let writer = SampleWriter::new(registry);
        writer.flush_buffer().await;
    }

    #[test]
    fn period_adoption_clamps_and_rounds() {
        let writer = SampleWriter::new(Arc::new(ChannelRegistry::new()));
        assert_eq!(writer.adopt_period(10.0), 10.0);
        assert_eq!(writer.adopt_period(0.25), 1.0);
        assert_eq!(writer.adopt_period(2.5), 3.0);
        assert_eq!(writer.period_seconds(), 3.0);
    }
}
