//! Media pipeline layer
//!
//! Everything between a resolved renderer connection and bytes on the wire:
//! - Control/Coordination: the `CastPipeline` boundary the session manager
//!   drives, and the `ScreenPipeline` coordinator behind it
//! - Data Transport: bounded channels with backpressure accounting and the
//!   TCP transmit stage
//! - Media Production: the `FrameSource` capture/encode collaborator
//! - Health: counters and stall detection feeding the failure channel
//!
//! Stages run in their own async tasks and communicate via channels; a
//! `CancellationToken` owned by the coordinator winds everything down.

pub mod health;
pub mod screen;
pub mod source;
pub mod traits;
pub mod types;

pub use health::{HealthMonitor, PipelineHealth};
pub use screen::ScreenPipeline;
pub use source::{BlankSource, FrameSource};
pub use traits::{CastPipeline, PipelineEvent, PipelineFactory};
pub use types::{MediaFrame, MediaKind, Timestamp};
