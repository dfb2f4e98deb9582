//! Error types for the archiver engine.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No type info found for PV '{0}'")]
    MissingTypeInfo(String),

    #[error("Unrecognized storage plugin URL '{0}'")]
    UnknownStoragePlugin(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cluster request failed: {0}")]
    Cluster(String),

    #[error("Command slot {0} is not available")]
    CommandSlotUnavailable(usize),
}
