pub mod config;
pub mod engine;
pub mod events;
pub mod models;
pub mod pool;
pub mod prober;
pub mod profiles;
pub mod registry;
pub mod selector;
pub mod stats;
pub mod transport;
pub mod tuning;
pub mod worker;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::engine::{Engine, EngineError};
    pub use crate::events::{LogEvent, Severity};
    pub use crate::models::{EngineSnapshot, EngineStatus, SourceDescriptor};
    pub use crate::prober::ProbeOutcome;
    pub use crate::transport::{ReqwestTransport, TransferError, Transport};
}
