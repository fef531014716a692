//! Cast session lifecycle management
//!
//! One `CastSessionManager` owns the casting state machine: device
//! selection, session establishment, the active pipeline handle, and status
//! broadcast to observers. User-initiated calls and asynchronous pipeline
//! failure signals both funnel through a single `tokio::sync::Mutex`, so
//! every operation completes its side effects before the next is accepted
//! and status callbacks fire in exact transition order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{CastConfig, CastMode};
use crate::discovery::DeviceResolver;
use crate::error::{CastError, Result};
use crate::pipeline::{CastPipeline, PipelineEvent, PipelineFactory};
use crate::session::state::CastState;

/// Status broadcast to observers on every session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Started,
    Stopped,
    Error,
    Disconnected,
}

impl StatusUpdate {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusUpdate::Started => "started",
            StatusUpdate::Stopped => "stopped",
            StatusUpdate::Error => "error",
            StatusUpdate::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observer invoked with each status transition. Callbacks run synchronously
/// under the session lock and must not call back into the manager.
pub type StatusCallback = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

struct SessionInner {
    device: Option<Uuid>,
    state: CastState,
    mode: CastMode,
    audio_enabled: bool,
    pipeline: Option<Box<dyn CastPipeline>>,
    /// Generation counter; bumped on every start/stop so in-flight monitor
    /// events from a previous attempt are recognized as stale and discarded.
    attempt: u64,
}

impl SessionInner {
    fn transition(&mut self, target: CastState) {
        debug_assert!(
            self.state.can_transition_to(&target),
            "invalid cast state transition {} -> {}",
            self.state,
            target
        );
        debug!("Cast state: {} -> {}", self.state, target);
        self.state = target;
    }
}

struct ManagerShared {
    inner: tokio::sync::Mutex<SessionInner>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

impl ManagerShared {
    fn broadcast(&self, status: StatusUpdate) {
        info!("Cast status: {status}");
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            let delivery = panic::catch_unwind(AssertUnwindSafe(|| callback(status)));
            if delivery.is_err() {
                error!("Error in cast status callback; continuing with remaining observers");
            }
        }
    }

    /// Wind down the active pipeline: `Casting → Stopping → DeviceSelected`,
    /// broadcasting `Stopped`. Resources are released even when the pipeline
    /// reports an error while stopping.
    async fn teardown(&self, inner: &mut SessionInner) {
        if let Some(duration) = inner.state.casting_duration() {
            info!("Cast session ran for {duration:?}");
        }
        inner.transition(CastState::Stopping);
        inner.attempt += 1;
        if let Some(mut pipeline) = inner.pipeline.take() {
            if let Err(err) = pipeline.stop().await {
                warn!("Pipeline reported an error while stopping: {err}");
            }
        }
        self.broadcast(StatusUpdate::Stopped);
        inner.transition(CastState::DeviceSelected);
    }

    /// React to an asynchronous pipeline signal. Returns false once the
    /// monitor that delivered it should stop watching.
    async fn handle_pipeline_event(&self, event: PipelineEvent, attempt: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt || !inner.state.is_casting() {
            debug!("Discarding stale pipeline event: {event}");
            return false;
        }

        warn!("Pipeline signalled: {event}");
        let (interim, status) = match event {
            PipelineEvent::RuntimeFailure(_) => (CastState::Error, StatusUpdate::Error),
            PipelineEvent::ConnectionLost(_) => (CastState::Disconnected, StatusUpdate::Disconnected),
        };

        inner.transition(interim);
        inner.attempt += 1;
        if let Some(mut pipeline) = inner.pipeline.take() {
            if let Err(err) = pipeline.stop().await {
                warn!("Pipeline reported an error while stopping: {err}");
            }
        }
        self.broadcast(status);
        inner.transition(CastState::DeviceSelected);
        false
    }
}

/// Owns the casting state machine and the one active pipeline per process.
pub struct CastSessionManager {
    shared: Arc<ManagerShared>,
    resolver: Arc<dyn DeviceResolver>,
    factory: PipelineFactory,
    config: CastConfig,
}

impl CastSessionManager {
    pub fn new(
        config: CastConfig,
        resolver: Arc<dyn DeviceResolver>,
        factory: PipelineFactory,
    ) -> Self {
        let audio_enabled = config.audio_enabled;
        CastSessionManager {
            shared: Arc::new(ManagerShared {
                inner: tokio::sync::Mutex::new(SessionInner {
                    device: None,
                    state: CastState::NoDevice,
                    mode: CastMode::Screen,
                    audio_enabled,
                    pipeline: None,
                    attempt: 0,
                }),
                callbacks: Mutex::new(Vec::new()),
            }),
            resolver,
            factory,
            config,
        }
    }

    /// Select the renderer to cast to. Any active pipeline is stopped first;
    /// resolution passes through `Connecting` and lands in `DeviceSelected`.
    /// On failure the prior selection is restored and the error returned.
    pub async fn select_device(&self, id: Uuid) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;

        if inner.state.is_casting() {
            self.shared.teardown(&mut inner).await;
        }

        let restore_state = inner.state;
        let restore_device = inner.device;
        inner.transition(CastState::Connecting);

        match self.resolver.resolve(id).await {
            Ok(connection) => {
                inner.device = Some(id);
                inner.transition(CastState::DeviceSelected);
                info!("Selected device '{}' ({id})", connection.name);
                Ok(())
            }
            Err(err) => {
                error!("Failed to select device {id}: {err}");
                inner.device = restore_device;
                inner.state = restore_state;
                Err(err)
            }
        }
    }

    /// Pure configuration mutation; rejected while a session is live rather
    /// than mutating a running pipeline.
    pub async fn set_cast_mode(&self, mode: CastMode) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_casting() {
            return Err(CastError::SessionBusy("cast mode change"));
        }
        inner.mode = mode;
        Ok(())
    }

    /// See [`Self::set_cast_mode`].
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_casting() {
            return Err(CastError::SessionBusy("audio toggle"));
        }
        inner.audio_enabled = enabled;
        Ok(())
    }

    /// Establish the session and start the pipeline with the current
    /// mode/audio settings. Broadcasts `Started` on success; any failure
    /// reverts to `DeviceSelected` and is returned to the caller.
    pub async fn start_casting(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;

        if inner.state.is_casting() {
            return Err(CastError::AlreadyCasting);
        }
        let Some(device) = inner.device else {
            return Err(CastError::NoDeviceSelected);
        };
        debug_assert!(inner.state.can_start(), "device set but state {}", inner.state);

        inner.attempt += 1;
        let attempt = inner.attempt;
        inner.transition(CastState::Connecting);

        let connection = match self.resolver.resolve(device).await {
            Ok(connection) => connection,
            Err(err) => {
                error!("Cannot start casting: {err}");
                inner.transition(CastState::DeviceSelected);
                return Err(err);
            }
        };

        let mut pipeline = (self.factory)(&self.config);
        match pipeline
            .start(&connection, inner.mode, inner.audio_enabled)
            .await
        {
            Ok(events) => {
                inner.pipeline = Some(pipeline);
                inner.transition(CastState::Casting {
                    since: Instant::now(),
                });
                info!("Casting to '{}' started", connection.name);
                self.shared.broadcast(StatusUpdate::Started);
                self.spawn_monitor(events, attempt);
                Ok(())
            }
            Err(err) => {
                error!("Failed to start casting to '{}': {err}", connection.name);
                // Never went live, but release anything it may have grabbed.
                if let Err(stop_err) = pipeline.stop().await {
                    warn!("Pipeline cleanup after failed start: {stop_err}");
                }
                inner.transition(CastState::DeviceSelected);
                Err(err)
            }
        }
    }

    /// Stop the active session. A no-op success when nothing is casting.
    pub async fn stop_casting(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.state.is_casting() {
            debug!("stop_casting: no active session");
            return Ok(());
        }
        self.shared.teardown(&mut inner).await;
        Ok(())
    }

    /// Register an observer for status transitions. Registering the same
    /// callback (by `Arc` identity) twice is a no-op.
    pub fn register_status_callback(&self, callback: StatusCallback) {
        let mut callbacks = self.shared.callbacks.lock().unwrap();
        if callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            return;
        }
        callbacks.push(callback);
    }

    /// Remove a previously registered observer; unknown callbacks are a
    /// no-op, never an error.
    pub fn unregister_status_callback(&self, callback: &StatusCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }

    pub async fn state(&self) -> CastState {
        self.shared.inner.lock().await.state
    }

    pub async fn selected_device(&self) -> Option<Uuid> {
        self.shared.inner.lock().await.device
    }

    pub async fn is_casting(&self) -> bool {
        self.shared.inner.lock().await.state.is_casting()
    }

    /// Exit-boundary helper: stop the session if one is active.
    pub async fn shutdown(&self) {
        if let Err(err) = self.stop_casting().await {
            warn!("Error stopping cast session during shutdown: {err}");
        }
    }

    fn spawn_monitor(&self, mut events: mpsc::Receiver<PipelineEvent>, attempt: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !shared.handle_pipeline_event(event, attempt).await {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceConnection;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedResolver {
        known: HashSet<Uuid>,
    }

    #[async_trait::async_trait]
    impl DeviceResolver for ScriptedResolver {
        async fn resolve(&self, id: Uuid) -> Result<DeviceConnection> {
            if self.known.contains(&id) {
                Ok(DeviceConnection {
                    id,
                    name: format!("renderer-{id}"),
                    addr: "127.0.0.1:8009".parse().unwrap(),
                })
            } else {
                Err(CastError::DeviceNotFound(id))
            }
        }
    }

    /// Shared accounting across every pipeline the factory hands out.
    #[derive(Default)]
    struct PipelineLedger {
        starts: AtomicUsize,
        stops: AtomicUsize,
        active: AtomicUsize,
        fail_start: AtomicBool,
        event_tx: Mutex<Option<mpsc::Sender<PipelineEvent>>>,
    }

    struct ScriptedPipeline {
        ledger: Arc<PipelineLedger>,
        running: bool,
    }

    #[async_trait::async_trait]
    impl CastPipeline for ScriptedPipeline {
        async fn start(
            &mut self,
            _connection: &DeviceConnection,
            _mode: CastMode,
            _audio_enabled: bool,
        ) -> Result<mpsc::Receiver<PipelineEvent>> {
            if self.ledger.fail_start.load(Ordering::SeqCst) {
                return Err(CastError::PipelineStart("scripted failure".to_string()));
            }
            self.ledger.starts.fetch_add(1, Ordering::SeqCst);
            let now_active = self.ledger.active.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(now_active, 1, "two pipelines active at once");
            self.running = true;

            let (event_tx, event_rx) = mpsc::channel(4);
            *self.ledger.event_tx.lock().unwrap() = Some(event_tx);
            Ok(event_rx)
        }

        async fn stop(&mut self) -> Result<()> {
            if self.running {
                self.running = false;
                self.ledger.active.fetch_sub(1, Ordering::SeqCst);
                self.ledger.stops.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct Harness {
        manager: Arc<CastSessionManager>,
        ledger: Arc<PipelineLedger>,
        statuses: Arc<Mutex<Vec<StatusUpdate>>>,
        device_a: Uuid,
        device_b: Uuid,
    }

    fn harness() -> Harness {
        let device_a = Uuid::new_v4();
        let device_b = Uuid::new_v4();
        let resolver = Arc::new(ScriptedResolver {
            known: HashSet::from([device_a, device_b]),
        });
        let ledger = Arc::new(PipelineLedger::default());
        let factory_ledger = Arc::clone(&ledger);
        let factory: PipelineFactory = Box::new(move |_config| {
            Box::new(ScriptedPipeline {
                ledger: Arc::clone(&factory_ledger),
                running: false,
            }) as Box<dyn CastPipeline>
        });

        let manager = Arc::new(CastSessionManager::new(
            CastConfig::default(),
            resolver,
            factory,
        ));

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        manager.register_status_callback(Arc::new(move |status| {
            sink.lock().unwrap().push(status);
        }));

        Harness {
            manager,
            ledger,
            statuses,
            device_a,
            device_b,
        }
    }

    async fn wait_until<F>(mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn select_start_runtime_failure_scenario() {
        let h = harness();

        h.manager.select_device(h.device_a).await.unwrap();
        assert_eq!(h.manager.state().await, CastState::DeviceSelected);

        h.manager.start_casting().await.unwrap();
        assert!(h.manager.is_casting().await);
        assert_eq!(*h.statuses.lock().unwrap(), vec![StatusUpdate::Started]);

        let event_tx = h.ledger.event_tx.lock().unwrap().clone().unwrap();
        event_tx
            .send(PipelineEvent::RuntimeFailure("encoder died".to_string()))
            .await
            .unwrap();

        let statuses = Arc::clone(&h.statuses);
        wait_until(move || statuses.lock().unwrap().len() == 2).await;

        assert_eq!(h.manager.state().await, CastState::DeviceSelected);
        assert_eq!(
            *h.statuses.lock().unwrap(),
            vec![StatusUpdate::Started, StatusUpdate::Error]
        );
        assert_eq!(h.ledger.active.load(Ordering::SeqCst), 0);
        assert_eq!(h.ledger.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_lost_maps_to_disconnected() {
        let h = harness();
        h.manager.select_device(h.device_a).await.unwrap();
        h.manager.start_casting().await.unwrap();

        let event_tx = h.ledger.event_tx.lock().unwrap().clone().unwrap();
        event_tx
            .send(PipelineEvent::ConnectionLost("peer reset".to_string()))
            .await
            .unwrap();

        let statuses = Arc::clone(&h.statuses);
        wait_until(move || statuses.lock().unwrap().len() == 2).await;

        assert_eq!(
            *h.statuses.lock().unwrap(),
            vec![StatusUpdate::Started, StatusUpdate::Disconnected]
        );
        assert_eq!(h.manager.state().await, CastState::DeviceSelected);
    }

    #[tokio::test]
    async fn stop_casting_without_session_is_a_noop() {
        let h = harness();
        h.manager.select_device(h.device_a).await.unwrap();

        h.manager.stop_casting().await.unwrap();
        assert_eq!(h.manager.state().await, CastState::DeviceSelected);
        assert!(h.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn select_while_casting_stops_the_previous_pipeline() {
        let h = harness();
        h.manager.select_device(h.device_a).await.unwrap();
        h.manager.start_casting().await.unwrap();

        h.manager.select_device(h.device_b).await.unwrap();

        assert_eq!(h.manager.state().await, CastState::DeviceSelected);
        assert_eq!(h.manager.selected_device().await, Some(h.device_b));
        assert_eq!(h.ledger.active.load(Ordering::SeqCst), 0);
        assert_eq!(
            *h.statuses.lock().unwrap(),
            vec![StatusUpdate::Started, StatusUpdate::Stopped]
        );
    }

    #[tokio::test]
    async fn failed_selection_restores_prior_selection() {
        let h = harness();
        let unknown = Uuid::new_v4();

        let result = h.manager.select_device(unknown).await;
        assert!(matches!(result, Err(CastError::DeviceNotFound(_))));
        assert_eq!(h.manager.state().await, CastState::NoDevice);
        assert_eq!(h.manager.selected_device().await, None);

        h.manager.select_device(h.device_a).await.unwrap();
        let result = h.manager.select_device(unknown).await;
        assert!(result.is_err());
        assert_eq!(h.manager.state().await, CastState::DeviceSelected);
        assert_eq!(h.manager.selected_device().await, Some(h.device_a));
    }

    #[tokio::test]
    async fn reconfiguration_is_rejected_mid_session() {
        let h = harness();
        h.manager.select_device(h.device_a).await.unwrap();
        h.manager.start_casting().await.unwrap();

        assert!(matches!(
            h.manager.set_cast_mode(CastMode::Screen).await,
            Err(CastError::SessionBusy(_))
        ));
        assert!(matches!(
            h.manager.set_audio_enabled(false).await,
            Err(CastError::SessionBusy(_))
        ));
        assert!(h.manager.is_casting().await);

        h.manager.stop_casting().await.unwrap();
        h.manager.set_audio_enabled(false).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_run_exactly_one_pipeline() {
        let h = harness();
        h.manager.select_device(h.device_a).await.unwrap();

        let first = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.start_casting().await })
        };
        let second = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.start_casting().await })
        };

        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(CastError::AlreadyCasting))));
        assert_eq!(h.ledger.starts.load(Ordering::SeqCst), 1);

        h.manager.stop_casting().await.unwrap();
    }

    #[tokio::test]
    async fn failed_pipeline_start_reverts_to_device_selected() {
        let h = harness();
        h.manager.select_device(h.device_a).await.unwrap();
        h.ledger.fail_start.store(true, Ordering::SeqCst);

        let result = h.manager.start_casting().await;
        assert!(matches!(result, Err(CastError::PipelineStart(_))));
        assert_eq!(h.manager.state().await, CastState::DeviceSelected);
        assert!(h.statuses.lock().unwrap().is_empty());

        // The session recovers once the pipeline behaves again.
        h.ledger.fail_start.store(false, Ordering::SeqCst);
        h.manager.start_casting().await.unwrap();
        assert!(h.manager.is_casting().await);
        h.manager.stop_casting().await.unwrap();
    }

    #[tokio::test]
    async fn starting_without_selection_is_rejected() {
        let h = harness();
        let result = h.manager.start_casting().await;
        assert!(matches!(result, Err(CastError::NoDeviceSelected)));
        assert_eq!(h.manager.state().await, CastState::NoDevice);
    }

    #[tokio::test]
    async fn duplicate_status_callback_is_a_noop() {
        let h = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let callback: StatusCallback = Arc::new(move |_status| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.manager.register_status_callback(Arc::clone(&callback));
        h.manager.register_status_callback(Arc::clone(&callback));

        h.manager.select_device(h.device_a).await.unwrap();
        h.manager.start_casting().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        h.manager.unregister_status_callback(&callback);
        h.manager.stop_casting().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_status_observer_does_not_block_the_rest() {
        let h = harness();
        let panicking: StatusCallback = Arc::new(|_status| panic!("observer bug"));
        h.manager.register_status_callback(panicking);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        h.manager.register_status_callback(Arc::new(move |_status| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        h.manager.select_device(h.device_a).await.unwrap();
        h.manager.start_casting().await.unwrap();

        assert_eq!(*h.statuses.lock().unwrap(), vec![StatusUpdate::Started]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        h.manager.stop_casting().await.unwrap();
    }
}
