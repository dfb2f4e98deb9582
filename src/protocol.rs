//! Channel-access protocol contracts.
//!
//! The engine never talks the wire protocol itself. Each command slot owns
//! one [`ProtocolContext`] created by a [`ProtocolProvider`]; all channel
//! operations for PVs assigned to that slot are serialised onto the slot's
//! task. The loopback implementations here stand in for a real protocol
//! library in tests and single-process deployments.

use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A native protocol channel as seen by the engine: just a name.
pub trait NativeChannel: Send + Sync {
    fn name(&self) -> &str;
}

/// One protocol context. Contexts are identity-compared via [`context_id`],
/// which must be unique within the process.
///
/// [`context_id`]: ProtocolContext::context_id
pub trait ProtocolContext: Send + Sync {
    fn context_id(&self) -> u64;

    /// Snapshot of the native channels currently open on this context.
    fn channels(&self) -> Vec<Arc<dyn NativeChannel>>;
}

/// Factory for protocol contexts. Creation may be slow; the command slot
/// awaits it off the engine's construction path.
#[async_trait]
pub trait ProtocolProvider: Send + Sync {
    async fn create_context(&self) -> Result<Arc<dyn ProtocolContext>, EngineError>;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// In-process native channel.
pub struct LoopbackChannel {
    name: String,
}

impl NativeChannel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }
}

/// In-process protocol context; channels are plain entries in a list.
pub struct LoopbackContext {
    id: u64,
    channels: parking_lot::Mutex<Vec<Arc<dyn NativeChannel>>>,
}

impl LoopbackContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            channels: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn open_channel(&self, name: impl Into<String>) {
        self.channels
            .lock()
            .push(Arc::new(LoopbackChannel { name: name.into() }));
    }

    pub fn close_channels_for(&self, name: &str) {
        self.channels.lock().retain(|c| c.name() != name);
    }
}

impl Default for LoopbackContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolContext for LoopbackContext {
    fn context_id(&self) -> u64 {
        self.id
    }

    fn channels(&self) -> Vec<Arc<dyn NativeChannel>> {
        self.channels.lock().clone()
    }
}

/// Provider handing out [`LoopbackContext`]s, optionally after a simulated
/// initialisation delay. Created contexts stay reachable through
/// [`LoopbackProvider::contexts`] so callers can open channels on them.
pub struct LoopbackProvider {
    init_delay: Option<std::time::Duration>,
    created: parking_lot::Mutex<Vec<Arc<LoopbackContext>>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            init_delay: None,
            created: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_init_delay(delay: std::time::Duration) -> Self {
        Self {
            init_delay: Some(delay),
            created: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Contexts created so far, in creation order.
    pub fn contexts(&self) -> Vec<Arc<LoopbackContext>> {
        self.created.lock().clone()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolProvider for LoopbackProvider {
    async fn create_context(&self) -> Result<Arc<dyn ProtocolContext>, EngineError> {
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        let context = Arc::new(LoopbackContext::new());
        self.created.lock().push(context.clone());
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_ids_are_unique() {
        let a = LoopbackContext::new();
        let b = LoopbackContext::new();
        assert_ne!(a.context_id(), b.context_id());
    }

    #[test]
    fn open_and_close_channels() {
        let ctx = LoopbackContext::new();
        ctx.open_channel("sim:x");
        ctx.open_channel("sim:x.HIHI");
        assert_eq!(ctx.channels().len(), 2);

        ctx.close_channels_for("sim:x");
        let remaining = ctx.channels();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name(), "sim:x.HIHI");
    }
}
