//! Screen casting pipeline
//!
//! Chains the capture/encode collaborator to a TCP transmit stage and
//! manages their lifecycle: source task → bounded frame channel → transmit
//! task, with a health monitor watching for stalls. Frames cross the wire
//! length-prefixed; the renderer side of the protocol lives with the device.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{CastConfig, CastMode};
use crate::discovery::DeviceConnection;
use crate::error::{CastError, Result};
use crate::pipeline::health::{HealthMonitor, PipelineHealth};
use crate::pipeline::source::FrameSource;
use crate::pipeline::traits::{CastPipeline, PipelineEvent};
use crate::pipeline::types::{MediaFrame, MediaKind};

const TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STAGE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const FRAME_CHANNEL_CAPACITY: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Frame header past the length prefix: flags byte + pts micros.
const FRAME_HEADER_LEN: usize = 1 + 8;

/// Coordinates the sender pipeline for one casting attempt.
///
/// A pipeline instance is single-use: the session manager builds a fresh one
/// per attempt through the pipeline factory.
pub struct ScreenPipeline {
    config: CastConfig,
    source: Option<Box<dyn FrameSource>>,
    health: Arc<PipelineHealth>,
    cancel: Option<CancellationToken>,
    stages: Vec<JoinHandle<()>>,
}

impl ScreenPipeline {
    pub fn new(config: CastConfig, source: Box<dyn FrameSource>) -> Self {
        ScreenPipeline {
            config,
            source: Some(source),
            health: Arc::new(PipelineHealth::new()),
            cancel: None,
            stages: Vec::new(),
        }
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }
}

#[async_trait]
impl CastPipeline for ScreenPipeline {
    async fn start(
        &mut self,
        connection: &DeviceConnection,
        mode: CastMode,
        audio_enabled: bool,
    ) -> Result<mpsc::Receiver<PipelineEvent>> {
        if self.cancel.is_some() {
            return Err(CastError::PipelineStart("pipeline already started".to_string()));
        }
        let mut source = self.source.take().ok_or_else(|| {
            CastError::PipelineStart("pipeline instance already consumed".to_string())
        })?;

        let stream = tokio::time::timeout(
            TRANSPORT_CONNECT_TIMEOUT,
            TcpStream::connect(connection.addr),
        )
        .await
        .map_err(|_| {
            CastError::PipelineStart(format!(
                "transport connect to {} timed out",
                connection.addr
            ))
        })?
        .map_err(|err| {
            CastError::PipelineStart(format!(
                "transport connect to {} failed: {err}",
                connection.addr
            ))
        })?;

        source
            .open(mode, audio_enabled)
            .await
            .map_err(|err| CastError::PipelineStart(format!("capture source failed: {err}")))?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        self.stages.push(tokio::spawn(run_source(
            source,
            frame_tx,
            event_tx.clone(),
            Arc::clone(&self.health),
            cancel.clone(),
        )));
        self.stages.push(tokio::spawn(run_transmit(
            stream,
            self.config.buffer_size,
            frame_rx,
            event_tx.clone(),
            Arc::clone(&self.health),
            cancel.clone(),
        )));

        let monitor = HealthMonitor::new(Arc::clone(&self.health), event_tx);
        self.stages.push(tokio::spawn(monitor.run(cancel.clone())));

        self.cancel = Some(cancel);
        info!(
            "Screen pipeline started: casting to '{}' ({}) at {}@{}fps",
            connection.name, connection.addr, self.config.resolution, self.config.framerate
        );
        Ok(event_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(cancel) = self.cancel.take() else {
            return Ok(());
        };
        cancel.cancel();

        for mut stage in self.stages.drain(..) {
            match tokio::time::timeout(STAGE_JOIN_TIMEOUT, &mut stage).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Pipeline stage ended abnormally: {err}"),
                Err(_) => {
                    warn!("Pipeline stage did not exit within {STAGE_JOIN_TIMEOUT:?}; aborting it");
                    stage.abort();
                }
            }
        }

        info!("Screen pipeline stopped: {}", self.health.summary());
        Ok(())
    }
}

/// Pulls frames from the capture collaborator into the frame channel.
/// Backpressure never blocks capture pacing: a full channel costs the frame,
/// recorded as a drop.
async fn run_source(
    mut source: Box<dyn FrameSource>,
    frame_tx: mpsc::Sender<MediaFrame>,
    event_tx: mpsc::Sender<PipelineEvent>,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => match frame {
                Ok(Some(frame)) => match frame_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => health.record_frame_drop(),
                    Err(TrySendError::Closed(_)) => break,
                },
                Ok(None) => break,
                Err(err) => {
                    let _ = event_tx
                        .send(PipelineEvent::RuntimeFailure(format!("capture failed: {err}")))
                        .await;
                    break;
                }
            }
        }
    }
    source.close().await;
}

/// Writes frames to the renderer transport. A write failure is reported as a
/// lost connection and ends the stage.
async fn run_transmit(
    stream: TcpStream,
    buffer_size: usize,
    mut frame_rx: mpsc::Receiver<MediaFrame>,
    event_tx: mpsc::Sender<PipelineEvent>,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
) {
    let mut writer = BufWriter::with_capacity(buffer_size.max(1), stream);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                match write_frame(&mut writer, &frame).await {
                    Ok(()) => health.record_frame(frame.size(), frame.is_keyframe),
                    Err(err) => {
                        health.record_network_error();
                        let _ = event_tx
                            .send(PipelineEvent::ConnectionLost(err.to_string()))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &MediaFrame,
) -> std::io::Result<()> {
    let mut flags = match frame.kind {
        MediaKind::Video => 0u8,
        MediaKind::Audio => 0x01,
    };
    if frame.is_keyframe {
        flags |= 0x02;
    }

    writer
        .write_u32((FRAME_HEADER_LEN + frame.data.len()) as u32)
        .await?;
    writer.write_u8(flags).await?;
    writer.write_u64(frame.pts.micros.max(0) as u64).await?;
    writer.write_all(&frame.data).await?;
    if frame.is_keyframe {
        writer.flush().await?;
    }
    Ok(())
}
