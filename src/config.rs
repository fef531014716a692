use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What gets captured and streamed. Only full-screen casting exists today;
/// the enum is the extension point for window or region casting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastMode {
    Screen,
}

impl FromStr for CastMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "screen" => Ok(CastMode::Screen),
            other => Err(format!("unknown cast mode '{other}'")),
        }
    }
}

impl std::fmt::Display for CastMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CastMode::Screen => write!(f, "screen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "2160p")]
    P2160,
}

impl Resolution {
    /// Output dimensions as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::P1440 => (2560, 1440),
            Resolution::P2160 => (3840, 2160),
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "720p" => Ok(Resolution::P720),
            "1080p" => Ok(Resolution::P1080),
            "1440p" => Ok(Resolution::P1440),
            "2160p" | "4k" => Ok(Resolution::P2160),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P1440 => "1440p",
            Resolution::P2160 => "2160p",
        };
        write!(f, "{name}")
    }
}

/// Runtime configuration. Persistence belongs to the caller; this crate only
/// consumes the values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastConfig {
    pub resolution: Resolution,
    pub framerate: u32,
    pub audio_enabled: bool,
    /// Device to auto-select once discovery reports it. Matched against the
    /// device identifier first, then the friendly name.
    pub preferred_device: Option<String>,
    /// Discovery refresh interval, seconds.
    pub discovery_timeout: u64,
    /// Transport write buffer, bytes.
    pub buffer_size: usize,
}

impl Default for CastConfig {
    fn default() -> Self {
        CastConfig {
            resolution: Resolution::P1080,
            framerate: 30,
            audio_enabled: true,
            preferred_device: None,
            discovery_timeout: 5,
            buffer_size: 8192,
        }
    }
}

impl CastConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout.max(1))
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parsing() {
        assert_eq!("1080p".parse::<Resolution>().unwrap(), Resolution::P1080);
        assert_eq!("4K".parse::<Resolution>().unwrap(), Resolution::P2160);
        assert!("800x600".parse::<Resolution>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CastConfig::default();
        assert_eq!(config.resolution, Resolution::P1080);
        assert_eq!(config.framerate, 30);
        assert!(config.audio_enabled);
        assert_eq!(config.discovery_timeout, 5);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn cast_mode_round_trip() {
        assert_eq!("screen".parse::<CastMode>().unwrap(), CastMode::Screen);
        assert_eq!(CastMode::Screen.to_string(), "screen");
    }
}
