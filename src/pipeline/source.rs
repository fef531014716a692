//! Capture/encode collaborator boundary.
//!
//! The crate never captures or encodes by itself: a `FrameSource` hands the
//! pipeline already-encoded frames. `BlankSource` is the built-in stand-in,
//! the moral equivalent of casting with the blank-screen capture option on.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;

use crate::config::{CastConfig, CastMode, Resolution};
use crate::error::Result;
use crate::pipeline::types::{MediaFrame, Timestamp};

/// Paced producer of encoded media frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Prepare capture for the given mode and audio setting.
    async fn open(&mut self, mode: CastMode, audio_enabled: bool) -> Result<()>;

    /// Produce the next encoded frame. `None` means the source is exhausted
    /// and the pipeline should wind down.
    async fn next_frame(&mut self) -> Result<Option<MediaFrame>>;

    /// Release capture resources.
    async fn close(&mut self);
}

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u16 = 2;
const AUDIO_SAMPLES_PER_FRAME: usize = 1024;

/// Framerate-paced source of blank video frames (and silence, when audio is
/// enabled), sized from the configured resolution.
pub struct BlankSource {
    resolution: Resolution,
    framerate: u32,
    video_payload: Bytes,
    audio_payload: Bytes,
    audio_enabled: bool,
    ticker: Option<tokio::time::Interval>,
    started: Option<Instant>,
    pending_audio: Option<MediaFrame>,
    frame_index: u64,
}

impl BlankSource {
    pub fn new(config: &CastConfig) -> Self {
        BlankSource {
            resolution: config.resolution,
            framerate: config.framerate.max(1),
            video_payload: Bytes::new(),
            audio_payload: Bytes::new(),
            audio_enabled: false,
            ticker: None,
            started: None,
            pending_audio: None,
            frame_index: 0,
        }
    }

    fn pts(&self) -> Timestamp {
        let elapsed = self
            .started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        Timestamp::from_duration(elapsed)
    }
}

#[async_trait]
impl FrameSource for BlankSource {
    async fn open(&mut self, mode: CastMode, audio_enabled: bool) -> Result<()> {
        let CastMode::Screen = mode;

        let (width, height) = self.resolution.dimensions();
        // One shared zeroed buffer per kind; Bytes clones are cheap.
        self.video_payload = Bytes::from(vec![0u8; (width * height * 3 / 2) as usize]);
        self.audio_payload = Bytes::from(vec![
            0u8;
            AUDIO_SAMPLES_PER_FRAME * AUDIO_CHANNELS as usize * 2
        ]);
        self.audio_enabled = audio_enabled;

        let frame_interval = Duration::from_secs(1) / self.framerate;
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        self.started = Some(Instant::now());
        self.frame_index = 0;

        debug!(
            "BlankSource opened: {}@{}fps, audio {}",
            self.resolution,
            self.framerate,
            if audio_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<MediaFrame>> {
        if let Some(audio) = self.pending_audio.take() {
            return Ok(Some(audio));
        }

        let Some(ticker) = self.ticker.as_mut() else {
            return Ok(None);
        };
        ticker.tick().await;

        let pts = self.pts();
        let (width, height) = self.resolution.dimensions();
        let is_keyframe = self.frame_index % u64::from(self.framerate) == 0;
        self.frame_index += 1;

        if self.audio_enabled {
            self.pending_audio = Some(MediaFrame::audio(
                self.audio_payload.clone(),
                pts,
                AUDIO_SAMPLE_RATE,
                AUDIO_CHANNELS,
            ));
        }

        Ok(Some(MediaFrame::video(
            self.video_payload.clone(),
            pts,
            is_keyframe,
            width,
            height,
        )))
    }

    async fn close(&mut self) {
        self.ticker = None;
        self.pending_audio = None;
        debug!("BlankSource closed after {} frames", self.frame_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::MediaKind;

    #[tokio::test]
    async fn first_frame_is_a_keyframe_with_configured_dimensions() {
        let config = CastConfig {
            resolution: Resolution::P720,
            audio_enabled: false,
            ..CastConfig::default()
        };
        let mut source = BlankSource::new(&config);
        source.open(CastMode::Screen, false).await.unwrap();

        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.kind, MediaKind::Video);
        assert!(frame.is_keyframe);
        assert_eq!(frame.width, Some(1280));
        assert_eq!(frame.height, Some(720));
        assert_eq!(frame.size(), 1280 * 720 * 3 / 2);

        source.close().await;
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audio_frames_interleave_when_enabled() {
        let mut source = BlankSource::new(&CastConfig::default());
        source.open(CastMode::Screen, true).await.unwrap();

        let video = source.next_frame().await.unwrap().unwrap();
        let audio = source.next_frame().await.unwrap().unwrap();
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(audio.kind, MediaKind::Audio);
        assert_eq!(audio.sample_rate, Some(AUDIO_SAMPLE_RATE));
        assert_eq!(audio.pts, video.pts);
    }
}
