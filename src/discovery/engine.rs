//! Background discovery of cast renderers over mDNS.
//!
//! One spawned task owns the `ServiceDaemon` and the known-device cache. It
//! ingests browse events as they arrive and, on a fixed poll interval,
//! rebuilds the device registry from the cache. A rebuilt registry is
//! installed and fanned out to observers only when it differs by value from
//! the installed snapshot.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CastConfig;
use crate::discovery::registry::{
    DeviceConnection, DeviceDescriptor, DeviceHandle, DeviceRegistry, DeviceStatus, RendererKind,
};
use crate::error::{CastError, Result};

/// Service type cast renderers advertise on the local network.
pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Bound on waiting for the discovery task to acknowledge cancellation.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the readiness wait inside `connect_to_device`.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failed refresh cycles before a cached device is evicted.
const MAX_MISSED_CYCLES: u32 = 3;

/// A record this old without an mDNS re-announcement is tagged unreachable.
const STALE_AFTER: Duration = Duration::from_secs(150);

/// Observer invoked with each freshly installed registry snapshot.
pub type DeviceCallback = Arc<dyn Fn(Arc<DeviceRegistry>) + Send + Sync>;

/// Raw fields cached from a resolved mDNS record, queried again on every
/// refresh cycle when the descriptor is rebuilt.
#[derive(Debug, Clone)]
struct ServiceRecord {
    fullname: String,
    address: Option<String>,
    port: u16,
    txt_id: Option<String>,
    friendly_name: Option<String>,
    model: Option<String>,
    receiver_status: Option<String>,
}

impl ServiceRecord {
    fn from_service(service: &ResolvedService) -> Self {
        // Prefer the lowest IPv4 address for a stable pick across refreshes.
        let mut v4: Vec<_> = service.get_addresses_v4().iter().copied().collect();
        v4.sort();
        ServiceRecord {
            fullname: service.get_fullname().to_string(),
            address: v4.first().map(ToString::to_string),
            port: service.get_port(),
            txt_id: text_property(service, "id"),
            friendly_name: text_property(service, "fn"),
            model: text_property(service, "md"),
            receiver_status: text_property(service, "st"),
        }
    }

    /// Stable identity: the advertised TXT id when parseable, otherwise
    /// derived deterministically from the service fullname.
    fn device_id(&self) -> Uuid {
        self.txt_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.fullname.as_bytes()))
    }
}

fn text_property(service: &ResolvedService, key: &str) -> Option<String> {
    service
        .get_property_val_str(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn instance_name(fullname: &str) -> String {
    fullname
        .trim()
        .strip_suffix(&format!(".{CAST_SERVICE_TYPE}"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

struct KnownDevice {
    record: ServiceRecord,
    last_seen: Instant,
    missed: u32,
}

impl KnownDevice {
    fn new(record: ServiceRecord) -> Self {
        KnownDevice {
            record,
            last_seen: Instant::now(),
            missed: 0,
        }
    }

    /// Rebuild the visible descriptor from the cached record. Failures here
    /// are the per-device query failures the refresh cycle traps.
    fn descriptor(&self, id: Uuid) -> Result<DeviceDescriptor> {
        let address_text = self.record.address.as_ref().ok_or_else(|| CastError::DeviceQuery {
            id,
            reason: "no IPv4 address advertised".to_string(),
        })?;
        let address: Ipv4Addr = address_text.parse().map_err(|_| CastError::DeviceQuery {
            id,
            reason: format!("unparseable address '{address_text}'"),
        })?;

        let name = self
            .record
            .friendly_name
            .clone()
            .unwrap_or_else(|| instance_name(&self.record.fullname));
        let model = self.record.model.clone().unwrap_or_default();
        let status = if self.last_seen.elapsed() > STALE_AFTER {
            DeviceStatus::Unreachable
        } else if self.record.receiver_status.as_deref() == Some("1") {
            DeviceStatus::Busy
        } else {
            DeviceStatus::Available
        };

        Ok(DeviceDescriptor {
            id,
            name,
            kind: RendererKind::from_model(&model),
            model,
            address,
            port: self.record.port,
            status,
            handle: DeviceHandle::new(address, self.record.port),
        })
    }
}

/// State shared between the engine facade and the background task.
struct EngineShared {
    poll_interval: Duration,
    registry: Mutex<Arc<DeviceRegistry>>,
    known: Mutex<HashMap<Uuid, KnownDevice>>,
    callbacks: Mutex<Vec<DeviceCallback>>,
    daemon: Mutex<Option<ServiceDaemon>>,
}

impl EngineShared {
    fn new(poll_interval: Duration) -> Self {
        EngineShared {
            poll_interval,
            registry: Mutex::new(Arc::new(DeviceRegistry::new())),
            known: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            daemon: Mutex::new(None),
        }
    }

    fn ingest_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(service) => {
                let record = ServiceRecord::from_service(&service);
                let id = record.device_id();
                debug!("Resolved cast device {id} ({})", record.fullname);
                {
                    let mut known = self.known.lock().unwrap();
                    match known.entry(id) {
                        std::collections::hash_map::Entry::Occupied(mut entry) => {
                            let device = entry.get_mut();
                            device.record = record;
                            device.last_seen = Instant::now();
                            device.missed = 0;
                        }
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            entry.insert(KnownDevice::new(record));
                        }
                    }
                }
                self.refresh();
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                // The TXT id left with the record, so removal is keyed by
                // the service fullname.
                {
                    let mut known = self.known.lock().unwrap();
                    known.retain(|_, device| device.record.fullname != fullname);
                }
                info!("Cast device '{fullname}' left the network");
                self.refresh();
            }
            _ => {}
        }
    }

    /// Rebuild the registry from the known-device cache, then install and
    /// broadcast it if anything visibly changed.
    fn refresh(&self) {
        let rebuilt = self.rebuild_registry();
        self.publish(rebuilt);
    }

    fn rebuild_registry(&self) -> DeviceRegistry {
        let mut known = self.known.lock().unwrap();
        let mut registry = DeviceRegistry::new();
        let mut evict = Vec::new();

        for (id, device) in known.iter_mut() {
            match device.descriptor(*id) {
                Ok(descriptor) => {
                    device.missed = 0;
                    registry.insert(descriptor);
                }
                Err(err) => {
                    device.missed += 1;
                    warn!(
                        "Error reading device info for {id}: {err} (missed cycle {}/{})",
                        device.missed, MAX_MISSED_CYCLES
                    );
                    if device.missed >= MAX_MISSED_CYCLES {
                        evict.push(*id);
                    }
                }
            }
        }

        for id in evict {
            known.remove(&id);
            info!("Evicted device {id} after {MAX_MISSED_CYCLES} failed refresh cycles");
        }

        registry
    }

    /// Install `rebuilt` and notify observers, but only on value inequality
    /// against the installed snapshot. Installation happens before
    /// notification so observers can only ever read the fresher state.
    fn publish(&self, rebuilt: DeviceRegistry) {
        let snapshot = {
            let mut current = self.registry.lock().unwrap();
            if **current == rebuilt {
                return;
            }
            let snapshot = Arc::new(rebuilt);
            *current = Arc::clone(&snapshot);
            snapshot
        };

        info!("Discovered {} cast devices", snapshot.len());
        self.notify(snapshot);
    }

    fn notify(&self, snapshot: Arc<DeviceRegistry>) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            let delivery =
                panic::catch_unwind(AssertUnwindSafe(|| callback(Arc::clone(&snapshot))));
            if delivery.is_err() {
                error!("Error in device discovery callback; continuing with remaining observers");
            }
        }
    }

    /// Idempotent release of the mDNS daemon. Called by the task's own
    /// cleanup and again, unconditionally, from `stop`.
    fn release_daemon(&self) {
        if let Some(daemon) = self.daemon.lock().unwrap().take() {
            if let Err(err) = daemon.stop_browse(CAST_SERVICE_TYPE) {
                debug!("Failed to stop mDNS browse cleanly: {err}");
            }
            if let Err(err) = daemon.shutdown() {
                debug!("Failed to shut mDNS daemon down cleanly: {err}");
            }
        }
    }
}

/// Continuously enumerates cast renderers on the local network.
pub struct DiscoveryEngine {
    shared: Arc<EngineShared>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryEngine {
    pub fn new(config: &CastConfig) -> Self {
        DiscoveryEngine {
            shared: Arc::new(EngineShared::new(config.poll_interval())),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Spawn the background discovery task. Idempotent: a second call while
    /// the task lives logs and returns without side effect.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            info!("Discovery is already running");
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(run_discovery(shared, token)));
        info!("Device discovery started");
    }

    /// Signal the background task to terminate, wait a bounded time for it
    /// to exit, then release the mDNS daemon unconditionally. Idempotent and
    /// safe to call from any task.
    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => info!("Device discovery stopped"),
                Err(_) => warn!("Discovery task did not exit within {STOP_TIMEOUT:?}; releasing resources anyway"),
            }
        }

        self.shared.release_daemon();
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Register an observer for registry changes. Registering the same
    /// callback (by `Arc` identity) twice is a no-op.
    pub fn register_callback(&self, callback: DeviceCallback) {
        let mut callbacks = self.shared.callbacks.lock().unwrap();
        if callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            return;
        }
        callbacks.push(callback);
    }

    /// Remove a previously registered observer. Unknown callbacks are a
    /// no-op, never an error.
    pub fn unregister_callback(&self, callback: &DeviceCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }

    /// Current registry snapshot. Immutable: the background task replaces
    /// the whole snapshot rather than mutating it in place.
    pub fn devices(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.shared.registry.lock().unwrap())
    }

    /// Resolve a device identifier to a connectable handle, waiting (bounded)
    /// for the renderer to report ready.
    pub async fn connect_to_device(&self, id: Uuid) -> Result<DeviceConnection> {
        let descriptor = {
            let registry = self.shared.registry.lock().unwrap();
            registry.get(&id).cloned()
        };
        let Some(descriptor) = descriptor else {
            error!("Device with UUID {id} not found");
            return Err(CastError::DeviceNotFound(id));
        };

        descriptor.handle.wait_ready(id, READY_TIMEOUT).await?;
        Ok(descriptor.connection())
    }
}

/// Resolution seam between the session manager and discovery, so sessions
/// can be driven against a scripted resolver in tests.
#[async_trait::async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn resolve(&self, id: Uuid) -> Result<DeviceConnection>;
}

#[async_trait::async_trait]
impl DeviceResolver for DiscoveryEngine {
    async fn resolve(&self, id: Uuid) -> Result<DeviceConnection> {
        self.connect_to_device(id).await
    }
}

/// Body of the background discovery task.
///
/// Failure to bring the mDNS daemon up is terminal: the task logs and exits,
/// leaving an empty, never-updated registry. Every exit path releases the
/// daemon.
async fn run_discovery(shared: Arc<EngineShared>, cancel: CancellationToken) {
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("Cannot discover devices: failed to start mDNS daemon: {err}");
            return;
        }
    };
    let events = match daemon.browse(CAST_SERVICE_TYPE) {
        Ok(receiver) => receiver,
        Err(err) => {
            error!("Cannot discover devices: failed to browse {CAST_SERVICE_TYPE}: {err}");
            let _ = daemon.shutdown();
            return;
        }
    };
    *shared.daemon.lock().unwrap() = Some(daemon);

    let mut poll = tokio::time::interval(shared.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => shared.ingest_event(event),
                Err(err) => {
                    error!("mDNS event channel closed: {err}");
                    break;
                }
            },
            _ = poll.tick() => shared.refresh(),
        }
    }

    shared.release_daemon();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(name: &str, address: Option<&str>) -> ServiceRecord {
        ServiceRecord {
            fullname: format!("{name}.{CAST_SERVICE_TYPE}"),
            address: address.map(ToString::to_string),
            port: 8009,
            txt_id: None,
            friendly_name: Some(name.to_string()),
            model: Some("Chromecast".to_string()),
            receiver_status: None,
        }
    }

    fn shared_with(records: Vec<ServiceRecord>) -> EngineShared {
        let shared = EngineShared::new(Duration::from_secs(5));
        {
            let mut known = shared.known.lock().unwrap();
            for r in records {
                known.insert(r.device_id(), KnownDevice::new(r));
            }
        }
        shared
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> DeviceCallback {
        Arc::new(move |_registry| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn identical_cycles_notify_once() {
        let shared = shared_with(vec![record("Living Room TV", Some("192.168.1.30"))]);
        let fired = Arc::new(AtomicUsize::new(0));
        shared
            .callbacks
            .lock()
            .unwrap()
            .push(counting_callback(Arc::clone(&fired)));

        shared.refresh();
        shared.refresh();
        shared.refresh();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(shared.registry.lock().unwrap().len(), 1);
    }

    #[test]
    fn attribute_change_notifies_with_updated_descriptor() {
        let shared = shared_with(vec![record("Living Room TV", Some("192.168.1.30"))]);
        let fired = Arc::new(AtomicUsize::new(0));
        shared
            .callbacks
            .lock()
            .unwrap()
            .push(counting_callback(Arc::clone(&fired)));

        shared.refresh();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same identity, new friendly name.
        {
            let mut known = shared.known.lock().unwrap();
            let device = known.values_mut().next().unwrap();
            device.record.friendly_name = Some("Renamed TV".to_string());
        }
        shared.refresh();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let registry = Arc::clone(&shared.registry.lock().unwrap());
        assert_eq!(registry.iter().next().unwrap().name, "Renamed TV");
    }

    #[test]
    fn failed_query_omits_device_and_evicts_after_limit() {
        let good = record("Living Room TV", Some("192.168.1.30"));
        let bad = record("Broken Device", None);
        let bad_id = bad.device_id();
        let shared = shared_with(vec![good, bad]);

        for _ in 0..MAX_MISSED_CYCLES {
            shared.refresh();
            // One unreachable device never aborts the rest of the cycle.
            assert_eq!(shared.registry.lock().unwrap().len(), 1);
        }

        assert!(!shared.known.lock().unwrap().contains_key(&bad_id));
    }

    #[test]
    fn panicking_observer_does_not_block_the_rest() {
        let shared = shared_with(vec![record("Living Room TV", Some("192.168.1.30"))]);
        let fired = Arc::new(AtomicUsize::new(0));
        let panicking: DeviceCallback = Arc::new(|_registry| panic!("observer bug"));
        shared.callbacks.lock().unwrap().push(panicking);
        shared
            .callbacks
            .lock()
            .unwrap()
            .push(counting_callback(Arc::clone(&fired)));

        shared.refresh();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let config = CastConfig::default();
        let engine = DiscoveryEngine::new(&config);
        let callback = counting_callback(Arc::new(AtomicUsize::new(0)));

        engine.register_callback(Arc::clone(&callback));
        engine.register_callback(Arc::clone(&callback));
        assert_eq!(engine.shared.callbacks.lock().unwrap().len(), 1);

        // Unknown unregistration is a no-op as well.
        let other = counting_callback(Arc::new(AtomicUsize::new(0)));
        engine.unregister_callback(&other);
        assert_eq!(engine.shared.callbacks.lock().unwrap().len(), 1);

        engine.unregister_callback(&callback);
        assert!(engine.shared.callbacks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_to_unknown_device_fails_fast() {
        let config = CastConfig::default();
        let engine = DiscoveryEngine::new(&config);

        let started = Instant::now();
        let result = engine.connect_to_device(Uuid::new_v4()).await;
        assert!(matches!(result, Err(CastError::DeviceNotFound(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_releases() {
        let config = CastConfig::default();
        let engine = DiscoveryEngine::new(&config);

        engine.start();
        engine.start(); // logged no-op while the task is alive

        engine.stop().await;
        assert!(!engine.is_running());
        // A second stop is a safe no-op.
        engine.stop().await;

        // The engine can be restarted after a stop.
        engine.start();
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name("Living-Room-TV._googlecast._tcp.local."),
            "Living-Room-TV"
        );
        assert_eq!(instance_name("oddball"), "oddball");
    }
}
