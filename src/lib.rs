//! # Archiver Engine
//!
//! Sampling/ingest engine core for an EPICS-style archiving appliance. The
//! engine subscribes to a large population of named process variables (PVs),
//! buffers the samples its channels collect, periodically flushes them to
//! pluggable storage, keeps the subscription population healthy and
//! coordinates metachannel startup with peer appliances in the cluster.
//!
//! ## Crate Structure
//!
//! - **`context`**: The [`context::EngineContext`] itself: process-wide
//!   engine state, the programmatic surface, and ordered shutdown. Start
//!   here.
//! - **`command`**: The pool of command slots, each serialising protocol I/O
//!   onto one dedicated task that owns one protocol context.
//! - **`registry`**: Concurrent base-name → channel registry and the stable
//!   PV → command slot assignment.
//! - **`writer`**: The periodic writer draining sample buffers to storage.
//! - **`monitor`**: The disconnect/reconnect monitor and staged metachannel
//!   startup.
//! - **`cluster`**: Peer appliance coordination client.
//! - **`bus`**: The typed event bus the engine answers archiving requests on.
//! - **`scheduler`**: Fixed-rate task scheduling shared by writer and monitor.
//! - **`config`**, **`channel`**, **`storage`**, **`protocol`**, **`facade`**:
//!   contracts to the collaborators the engine drives (the configuration
//!   service, per-PV archive channels, storage plugins, the protocol
//!   library and the channel-creation facade), plus in-memory
//!   implementations where a built-in makes sense.
//! - **`metadata`**, **`pvnames`**, **`error`**: metadata computation
//!   tracking, PV name handling and the error taxonomy.

pub mod bus;
pub mod channel;
pub mod cluster;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod metadata;
pub mod monitor;
pub mod protocol;
pub mod pvnames;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod writer;

pub use context::EngineContext;
pub use error::EngineError;
