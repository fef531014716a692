use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CastError>;

#[derive(Error, Debug)]
pub enum CastError {
    /// The mDNS daemon could not be brought up. Terminal for discovery:
    /// the registry stays empty and never updates.
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// A single device's descriptor could not be read this cycle.
    /// Recovered locally; the device is omitted from the rebuilt registry.
    #[error("device query failed for {id}: {reason}")]
    DeviceQuery { id: Uuid, reason: String },

    #[error("device {0} not found")]
    DeviceNotFound(Uuid),

    #[error("device {id} not ready after {after:?}")]
    ConnectionTimeout { id: Uuid, after: Duration },

    #[error("pipeline failed to start: {0}")]
    PipelineStart(String),

    #[error("pipeline failure while casting: {0}")]
    PipelineRuntime(String),

    #[error("connection to renderer lost: {0}")]
    ConnectionLost(String),

    /// A casting session is active and the operation would disturb it.
    #[error("operation rejected while casting: {0}")]
    SessionBusy(&'static str),

    #[error("no device selected")]
    NoDeviceSelected,

    #[error("already casting")]
    AlreadyCasting,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
