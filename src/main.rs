use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Arg, ArgAction, Command};
use log::{info, warn};

use crate::config::{CastConfig, CastMode, Resolution};
use crate::discovery::{DeviceResolver, DiscoveryEngine};
use crate::pipeline::{BlankSource, CastPipeline, PipelineFactory, ScreenPipeline};
use crate::session::CastSessionManager;

pub mod config;
pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod session;

/// How long to keep looking for a requested device before giving up.
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(config::app_name())
        .version(config::version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .help("Discover renderers on the network, print them and exit.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the device list as JSON (with --list).")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("NAME|UUID")
                .help("Cast to this device (by friendly name or identifier)."),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .default_value("screen")
                .help("What to cast."),
        )
        .arg(
            Arg::new("resolution")
                .short('r')
                .long("resolution")
                .value_name("RES")
                .help("Stream resolution (720p, 1080p, 1440p, 2160p)."),
        )
        .arg(
            Arg::new("framerate")
                .short('f')
                .long("framerate")
                .value_name("FPS")
                .help("Stream framerate."),
        )
        .arg(
            Arg::new("no-audio")
                .long("no-audio")
                .help("Cast video only.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .help("Discovery refresh interval."),
        )
        .get_matches();

    let mut cast_config = CastConfig::default();
    if let Some(resolution) = matches.get_one::<String>("resolution") {
        cast_config.resolution = resolution
            .parse::<Resolution>()
            .map_err(anyhow::Error::msg)?;
    }
    if let Some(framerate) = matches.get_one::<String>("framerate") {
        cast_config.framerate = framerate
            .parse::<u32>()
            .context("framerate must be an integer")?;
    }
    if let Some(timeout) = matches.get_one::<String>("timeout") {
        cast_config.discovery_timeout = timeout
            .parse::<u64>()
            .context("timeout must be an integer number of seconds")?;
    }
    if matches.get_flag("no-audio") {
        cast_config.audio_enabled = false;
    }
    if let Some(device) = matches.get_one::<String>("device") {
        cast_config.preferred_device = Some(device.clone());
    }
    let mode = matches
        .get_one::<String>("mode")
        .unwrap()
        .parse::<CastMode>()
        .map_err(anyhow::Error::msg)?;

    let engine = Arc::new(DiscoveryEngine::new(&cast_config));
    // Log registry changes, standing in for the tray's device submenu.
    engine.register_callback(Arc::new(|registry| {
        for device in registry.sorted() {
            info!(
                "  {} ({}) [{:?}] {}:{} {:?}",
                device.name, device.model, device.kind, device.address, device.port, device.status
            );
        }
    }));
    engine.start();

    if matches.get_flag("list") {
        // Give discovery a couple of refresh cycles to settle.
        tokio::time::sleep(cast_config.poll_interval() * 2).await;
        let registry = engine.devices();
        if matches.get_flag("json") {
            println!("{}", serde_json::to_string_pretty(&*registry)?);
        } else if registry.is_empty() {
            println!("No devices found");
        } else {
            for device in registry.sorted() {
                println!(
                    "{}  {}  {}  {}:{}",
                    device.id, device.name, device.model, device.address, device.port
                );
            }
        }
        engine.stop().await;
        return Ok(());
    }

    let Some(target) = cast_config.preferred_device.clone() else {
        engine.stop().await;
        bail!("no device requested; pass --device <NAME|UUID> or --list");
    };

    let resolver: Arc<dyn DeviceResolver> = engine.clone();
    let factory: PipelineFactory = Box::new(|config: &CastConfig| {
        Box::new(ScreenPipeline::new(
            config.clone(),
            Box::new(BlankSource::new(config)),
        )) as Box<dyn CastPipeline>
    });
    let manager = CastSessionManager::new(cast_config.clone(), resolver, factory);
    manager.register_status_callback(Arc::new(|status| {
        info!("Cast status changed: {status}");
    }));

    let device_id = wait_for_device(&engine, &target).await?;
    manager
        .select_device(device_id)
        .await
        .map_err(|err| anyhow::anyhow!("failed to select device '{target}': {err}"))?;
    manager.set_cast_mode(mode).await?;
    manager.set_audio_enabled(cast_config.audio_enabled).await?;
    manager
        .start_casting()
        .await
        .context("failed to start casting")?;

    info!("Casting to '{target}'. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    // Exit boundary: release the session, then the discovery primitive.
    if manager.is_casting().await {
        info!("Stopping active cast session before exit");
    }
    manager.shutdown().await;
    engine.stop().await;
    Ok(())
}

/// Poll the registry until the requested device shows up.
async fn wait_for_device(engine: &DiscoveryEngine, needle: &str) -> anyhow::Result<uuid::Uuid> {
    let deadline = tokio::time::Instant::now() + DEVICE_WAIT_TIMEOUT;
    info!("Waiting for device '{needle}' to appear...");

    loop {
        if let Some(descriptor) = engine.devices().find(needle) {
            return Ok(descriptor.id);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Device '{needle}' not discovered within {DEVICE_WAIT_TIMEOUT:?}");
            engine.stop().await;
            bail!("device '{needle}' not found on the network");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
