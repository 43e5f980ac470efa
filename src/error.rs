// Engine error taxonomy
// Fatal and caller-visible failures; per-transaction failures travel as response codes instead

use thiserror::Error;

/// Errors surfaced by the engine's public API
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration or start parameters
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The buffer arena cannot serve the requested number of slices
    #[error("buffer arena exhausted: {requested} slices requested, {capacity} available")]
    BufferExhausted { requested: usize, capacity: usize },

    /// A state pool had nothing left to hand out
    #[error("{0} state pool is empty")]
    PoolEmpty(&'static str),

    /// Environment validation rejected the host
    #[error("environment validation failed: {0}")]
    Environment(String),

    /// `start` was called on an engine that is already listening
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::BufferExhausted { .. } | EngineError::Environment(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
