//! Command slot pool.
//!
//! Protocol I/O is sharded over N command slots. Each slot runs one task
//! that owns one protocol context and drains a command queue, so every
//! channel operation for PVs assigned to that slot is serialised while
//! different slots proceed in parallel. Context creation happens inside the
//! slot task and may lag; the pool waits for all contexts behind a single
//! deadline before declaring startup complete.

use crate::error::EngineError;
use crate::protocol::{NativeChannel, ProtocolContext, ProtocolProvider};
use crate::pvnames;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How long the pool waits for every slot's protocol context at startup.
pub const CONTEXT_STARTUP_DEADLINE: Duration = Duration::from_secs(60);

type CommandFn = Box<dyn FnOnce(&Arc<dyn ProtocolContext>) + Send>;

enum SlotMessage {
    Run(CommandFn),
    Shutdown,
}

/// One command slot: a queue feeding a dedicated task that owns the slot's
/// protocol context.
pub struct CommandThread {
    slot: usize,
    queue: mpsc::UnboundedSender<SlotMessage>,
    context_rx: watch::Receiver<Option<Arc<dyn ProtocolContext>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CommandThread {
    fn spawn(slot: usize, provider: Arc<dyn ProtocolProvider>) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (context_tx, context_rx) = watch::channel(None::<Arc<dyn ProtocolContext>>);

        let handle = tokio::spawn(async move {
            let context = match provider.create_context().await {
                Ok(ctx) => {
                    let _ = context_tx.send(Some(ctx.clone()));
                    Some(ctx)
                }
                Err(e) => {
                    error!(slot, error = %e, "Failed to create protocol context for command slot");
                    None
                }
            };

            while let Some(message) = queue_rx.recv().await {
                match message {
                    SlotMessage::Run(command) => match &context {
                        Some(ctx) => command(ctx),
                        // Degrade gracefully: without a context the command
                        // cannot run, drop it rather than wedge the queue.
                        None => warn!(slot, "Dropping command, slot has no protocol context"),
                    },
                    SlotMessage::Shutdown => break,
                }
            }
        });

        Self {
            slot,
            queue: queue_tx,
            context_rx,
            task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The slot's protocol context, if initialisation has completed.
    pub fn context(&self) -> Option<Arc<dyn ProtocolContext>> {
        self.context_rx.borrow().clone()
    }

    /// Enqueues a command for execution on the slot's task.
    pub fn run(
        &self,
        command: impl FnOnce(&Arc<dyn ProtocolContext>) + Send + 'static,
    ) -> Result<(), EngineError> {
        self.queue
            .send(SlotMessage::Run(Box::new(command)))
            .map_err(|_| EngineError::CommandSlotUnavailable(self.slot))
    }

    async fn wait_for_context(&self, deadline: tokio::time::Instant) -> bool {
        let mut rx = self.context_rx.clone();
        loop {
            if rx.borrow().is_some() {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Elapsed, or the slot task dropped its sender.
                _ => return rx.borrow().is_some(),
            }
        }
    }

    async fn shutdown(&self) {
        let _ = self.queue.send(SlotMessage::Shutdown);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(slot = self.slot, error = %e, "Command slot task ended abnormally");
                }
            }
        }
    }
}

/// The pool of command slots plus the slot → context mapping frozen at
/// startup.
pub struct CommandThreadPool {
    threads: Vec<CommandThread>,
    /// Written once after the startup barrier, read-only afterwards. A slot
    /// whose context never initialised stays `None`.
    contexts: Vec<Option<Arc<dyn ProtocolContext>>>,
}

impl CommandThreadPool {
    /// Spawns `count` slots and waits up to [`CONTEXT_STARTUP_DEADLINE`] for
    /// every context to initialise.
    pub async fn start(count: usize, provider: Arc<dyn ProtocolProvider>) -> Self {
        Self::start_with_deadline(count, provider, CONTEXT_STARTUP_DEADLINE).await
    }

    pub async fn start_with_deadline(
        count: usize,
        provider: Arc<dyn ProtocolProvider>,
        deadline: Duration,
    ) -> Self {
        let threads: Vec<CommandThread> = (0..count)
            .map(|slot| CommandThread::spawn(slot, provider.clone()))
            .collect();

        let deadline = tokio::time::Instant::now() + deadline;
        let ready =
            futures::future::join_all(threads.iter().map(|t| t.wait_for_context(deadline))).await;

        let mut contexts = Vec::with_capacity(count);
        for (thread, initialized) in threads.iter().zip(ready) {
            if !initialized {
                // Leave the slot degraded rather than failing the engine.
                error!(
                    slot = thread.slot(),
                    "Protocol context not initialized within the startup deadline"
                );
            }
            contexts.push(thread.context());
        }

        Self { threads, contexts }
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn thread(&self, slot: usize) -> Option<&CommandThread> {
        self.threads.get(slot)
    }

    /// Verifies a callback's context is the one expected for `slot`. When
    /// the slot has no recorded context the callback is accepted: dropping
    /// data over a degraded slot is worse than a misattributed sample.
    pub fn context_matches_slot(&self, context: &dyn ProtocolContext, slot: usize) -> bool {
        match self.contexts.get(slot) {
            Some(Some(expected)) => expected.context_id() == context.context_id(),
            _ => {
                error!(slot, "No protocol context recorded for command slot");
                true
            }
        }
    }

    /// Walks every slot's context and returns the native channels whose base
    /// name matches the PV's. Test affordance; avoid on busy servers.
    pub fn all_channels_for_pv(&self, pv_name: &str) -> Vec<(usize, Arc<dyn NativeChannel>)> {
        let base = pvnames::base_name(pv_name);
        let mut found = Vec::new();
        for (slot, context) in self.contexts.iter().enumerate() {
            let Some(context) = context else { continue };
            for channel in context.channels() {
                if pvnames::base_name(channel.name()) == base {
                    found.push((slot, channel.clone()));
                }
            }
        }
        found
    }

    pub async fn shutdown_all(&self) {
        for thread in &self.threads {
            debug!(slot = thread.slot(), "Shutting down command slot");
            thread.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LoopbackContext, LoopbackProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn pool_initializes_all_contexts() {
        let pool = CommandThreadPool::start(4, Arc::new(LoopbackProvider::new())).await;
        assert_eq!(pool.len(), 4);
        for slot in 0..4 {
            assert!(pool.thread(slot).unwrap().context().is_some());
        }
    }

    #[tokio::test]
    async fn commands_are_serialized_on_the_slot_task() {
        let pool = CommandThreadPool::start(1, Arc::new(LoopbackProvider::new())).await;
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        for _ in 0..99 {
            let counter = counter.clone();
            pool.thread(0)
                .unwrap()
                .run(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let counter_last = counter.clone();
        pool.thread(0)
            .unwrap()
            .run(move |_ctx| {
                counter_last.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
            .unwrap();

        done_rx.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_context_leaves_slot_degraded() {
        let provider = Arc::new(LoopbackProvider::with_init_delay(Duration::from_secs(600)));
        let pool = CommandThreadPool::start(2, provider).await;

        // Neither slot initialized inside the deadline; callbacks must still
        // be accepted.
        let stray = LoopbackContext::new();
        assert!(pool.context_matches_slot(&stray, 0));
        assert!(pool.context_matches_slot(&stray, 1));
        assert!(pool.thread(0).unwrap().context().is_none());
    }

    #[tokio::test]
    async fn context_matching_by_identity() {
        let pool = CommandThreadPool::start(2, Arc::new(LoopbackProvider::new())).await;
        let ctx0 = pool.thread(0).unwrap().context().unwrap();
        let ctx1 = pool.thread(1).unwrap().context().unwrap();
        assert!(pool.context_matches_slot(ctx0.as_ref(), 0));
        assert!(!pool.context_matches_slot(ctx1.as_ref(), 0));
        // Out-of-range slots are treated like missing contexts.
        assert!(pool.context_matches_slot(ctx0.as_ref(), 99));
    }

    #[tokio::test]
    async fn channel_enumeration_matches_base_name() {
        let provider = Arc::new(LoopbackProvider::new());
        let pool = CommandThreadPool::start(2, provider.clone()).await;

        let contexts = provider.contexts();
        contexts[0].open_channel("sim:x");
        contexts[0].open_channel("sim:x.HIHI");
        contexts[1].open_channel("sim:y");

        let for_x = pool.all_channels_for_pv("sim:x");
        assert_eq!(for_x.len(), 2);
        assert!(pool.all_channels_for_pv("sim:x.LOLO").len() == 2);
        assert_eq!(pool.all_channels_for_pv("sim:z").len(), 0);
    }
}
