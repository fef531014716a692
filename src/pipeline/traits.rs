//! The pluggable boundary between the session manager and the
//! capture→encode→transmit machinery.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{CastConfig, CastMode};
use crate::discovery::DeviceConnection;
use crate::error::Result;

/// Asynchronous failure signal emitted by a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Internal pipeline fault (capture died, stages stalled).
    RuntimeFailure(String),
    /// The transport to the renderer dropped. An expected, recoverable
    /// network condition, kept apart from internal faults.
    ConnectionLost(String),
}

impl std::fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineEvent::RuntimeFailure(reason) => write!(f, "pipeline failure: {reason}"),
            PipelineEvent::ConnectionLost(reason) => write!(f, "connection lost: {reason}"),
        }
    }
}

/// A capture→encode→transmit unit.
///
/// Exactly one pipeline may be active per process; the session manager owns
/// the handle exclusively and is the only component allowed to start or stop
/// it.
#[async_trait]
pub trait CastPipeline: Send {
    /// Start streaming to the connected renderer. On success returns the
    /// receiving end of the pipeline's failure channel.
    async fn start(
        &mut self,
        connection: &DeviceConnection,
        mode: CastMode,
        audio_enabled: bool,
    ) -> Result<mpsc::Receiver<PipelineEvent>>;

    /// Stop streaming and release every held resource. Implementations must
    /// release even when a stage erred; a returned error is informational.
    async fn stop(&mut self) -> Result<()>;
}

/// Builds a fresh pipeline per casting attempt.
pub type PipelineFactory = Box<dyn Fn(&CastConfig) -> Box<dyn CastPipeline> + Send + Sync>;
