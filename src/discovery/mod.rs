//! Renderer discovery: the mDNS-backed engine and the diffable registry it
//! publishes.

pub mod engine;
pub mod registry;

pub use engine::{CAST_SERVICE_TYPE, DeviceCallback, DeviceResolver, DiscoveryEngine};
pub use registry::{
    DeviceConnection, DeviceDescriptor, DeviceRegistry, DeviceStatus, RendererKind,
};
