//! Cast session state management

use std::time::Instant;

/// Cast session state machine
///
/// Represents the current state of the casting session. State transitions
/// are validated to keep the manager's behavior consistent; there is no
/// terminal state — stop, error and disconnect all route back toward
/// `DeviceSelected`, ready for the next start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CastState {
    /// No renderer selected yet
    NoDevice,

    /// A renderer is selected and ready to cast to
    DeviceSelected,

    /// Resolving the selected renderer / establishing the session
    Connecting,

    /// Actively streaming to the renderer
    Casting {
        /// When streaming started
        since: Instant,
    },

    /// Winding the pipeline down after a stop request
    Stopping,

    /// The pipeline reported an internal fault
    Error,

    /// The connection to the renderer was lost
    Disconnected,
}

impl CastState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &CastState) -> bool {
        use CastState::*;

        match (self, target) {
            // Selecting a device resolves through Connecting
            (NoDevice, Connecting) => true,
            (DeviceSelected, Connecting) => true,

            // From Connecting: success lands on DeviceSelected or goes
            // straight into Casting; failure restores the prior state
            (Connecting, DeviceSelected) => true,
            (Connecting, Casting { .. }) => true,
            (Connecting, NoDevice) => true,

            // From Casting: explicit stop, internal fault, or lost link
            (Casting { .. }, Stopping) => true,
            (Casting { .. }, Error) => true,
            (Casting { .. }, Disconnected) => true,

            // All three roads lead back to DeviceSelected
            (Stopping, DeviceSelected) => true,
            (Error, DeviceSelected) => true,
            (Disconnected, DeviceSelected) => true,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            CastState::NoDevice => "NoDevice",
            CastState::DeviceSelected => "DeviceSelected",
            CastState::Connecting => "Connecting",
            CastState::Casting { .. } => "Casting",
            CastState::Stopping => "Stopping",
            CastState::Error => "Error",
            CastState::Disconnected => "Disconnected",
        }
    }

    /// Check if the session is currently streaming
    pub fn is_casting(&self) -> bool {
        matches!(self, CastState::Casting { .. })
    }

    /// Check if a start request would be accepted from this state
    pub fn can_start(&self) -> bool {
        matches!(self, CastState::DeviceSelected)
    }

    /// Get the duration since streaming started (if casting)
    pub fn casting_duration(&self) -> Option<std::time::Duration> {
        if let CastState::Casting { since } = self {
            Some(since.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for CastState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
