// Transactional TCP server core
// Pooled connection state, admission control and one-shot provider forwarding

pub mod buffer;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod observability;
pub mod pool;
pub mod runtime;
pub mod signals;
pub mod state;
pub mod supervisor;

pub use config::EngineConfig;
pub use engine::{EngineStats, ServerEngine, StartOptions};
pub use error::{EngineError, Result};
pub use handler::{ClientSession, Outcome, Protocol, ProviderSession, ResponseCode};
pub use state::{ClientConnectionState, ProviderConnectionState};
