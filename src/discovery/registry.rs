//! Passive device bookkeeping: descriptors and the diffable registry.
//!
//! The registry carries no behavior beyond value equality; the discovery
//! engine rebuilds it each cycle and publishes it as an immutable snapshot.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::error::{CastError, Result};

/// Liveness tag reported alongside each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Available,
    /// Recent refresh cycles failed to read the device; it will be evicted
    /// if the condition persists.
    Unreachable,
    /// The renderer reports an active receiver app of its own.
    Busy,
}

/// Renderer category, derived from the advertised model the same way
/// pychromecast classifies cast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    Video,
    Audio,
    Group,
}

impl RendererKind {
    pub fn from_model(model: &str) -> Self {
        match model {
            "Google Cast Group" => RendererKind::Group,
            "Chromecast Audio" | "Google Home Mini" | "Google Nest Mini" => RendererKind::Audio,
            _ => RendererKind::Video,
        }
    }
}

/// Opaque connectable handle, owned by the discovery subsystem.
///
/// Wraps the renderer's advertised endpoint together with the readiness
/// probe used by `connect_to_device`. Carries no state that matters for
/// registry diffing.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    addr: SocketAddr,
}

impl DeviceHandle {
    pub(crate) fn new(address: Ipv4Addr, port: u16) -> Self {
        DeviceHandle {
            addr: SocketAddr::from((address, port)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the renderer accepts a TCP connection, bounded by
    /// `timeout`. The probe connection is dropped immediately; casting opens
    /// its own transport.
    pub(crate) async fn wait_ready(&self, id: Uuid, timeout: Duration) -> Result<()> {
        const PROBE_RETRY: Duration = Duration::from_millis(250);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CastError::ConnectionTimeout { id, after: timeout });
            }
            match tokio::time::timeout(remaining.min(PROBE_RETRY), TcpStream::connect(self.addr))
                .await
            {
                Ok(Ok(_stream)) => return Ok(()),
                Ok(Err(_)) | Err(_) => tokio::time::sleep(PROBE_RETRY).await,
            }
        }
    }
}

/// A connection ready to be handed to the pipeline. Produced only by
/// `DiscoveryEngine::connect_to_device`.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub id: Uuid,
    pub name: String,
    pub addr: SocketAddr,
}

/// One discovered renderer device.
///
/// The identifier is immutable once assigned; every other field refreshes in
/// place on rediscovery. Equality ignores the opaque handle so that registry
/// diffing reacts to visible changes only.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescriptor {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub kind: RendererKind,
    pub address: Ipv4Addr,
    pub port: u16,
    pub status: DeviceStatus,
    #[serde(skip)]
    pub(crate) handle: DeviceHandle,
}

impl DeviceDescriptor {
    pub fn connection(&self) -> DeviceConnection {
        DeviceConnection {
            id: self.id,
            name: self.name.clone(),
            addr: self.handle.addr(),
        }
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.model == other.model
            && self.kind == other.kind
            && self.address == other.address
            && self.port == other.port
            && self.status == other.status
    }
}

impl Eq for DeviceDescriptor {}

/// Mapping from device identity to descriptor.
///
/// Published snapshots are immutable: the engine never mutates an installed
/// registry, it replaces the whole snapshot, so concurrent readers need no
/// locking of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceRegistry {
    devices: HashMap<Uuid, DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, descriptor: DeviceDescriptor) {
        self.devices.insert(descriptor.id, descriptor);
    }

    pub fn get(&self, id: &Uuid) -> Option<&DeviceDescriptor> {
        self.devices.get(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values()
    }

    /// Devices ordered by friendly name, for display surfaces.
    pub fn sorted(&self) -> Vec<&DeviceDescriptor> {
        let mut devices: Vec<_> = self.iter().collect();
        devices.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        devices
    }

    /// Lookup by identifier string or friendly name (case-insensitive), the
    /// matching order used for `preferred_device`.
    pub fn find(&self, needle: &str) -> Option<&DeviceDescriptor> {
        if let Ok(id) = Uuid::parse_str(needle) {
            if let Some(descriptor) = self.devices.get(&id) {
                return Some(descriptor);
            }
        }
        self.devices
            .values()
            .find(|d| d.name.eq_ignore_ascii_case(needle))
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor(name: &str) -> DeviceDescriptor {
    let address = Ipv4Addr::new(192, 168, 1, 30);
    DeviceDescriptor {
        id: Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()),
        name: name.to_string(),
        model: "Chromecast".to_string(),
        kind: RendererKind::Video,
        address,
        port: 8009,
        status: DeviceStatus::Available,
        handle: DeviceHandle::new(address, 8009),
    }
}
