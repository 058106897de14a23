// Geotrack: background location telemetry engine
//
// Raw fixes pass the motion classifier and the sampling controller, land in
// the location store and leave through the sync engine to a remote
// collector. Transitions and samples fan out through the event dispatcher.

pub mod config;
pub mod events;
pub mod location;
pub mod logging;
pub mod motion;
pub mod pipeline;
pub mod platform;
pub mod sampling;
pub mod store;
pub mod sync;

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::oneshot;

pub use config::{Accuracy, Config, ConfigError, ConfigHandle, ConfigSnapshot};
pub use events::{ErrorPayload, Event, EventName, HeadlessHandler, Observer};
pub use location::{Location, LocationProviderKind, LocationSample, MockInfo, StationaryRegion, SyncStatus};
pub use motion::{ActivityObservation, ActivityType, MotionState};
pub use platform::{
    AuthorizationStatus, FixSource, HostSignal, OperatingMode, PipelineState, PositionOptions,
    ProviderEvent, ServiceStatus,
};
pub use sampling::ProviderRequest;
pub use store::{LocationFilter, LogEntry, LogLevel, StoreError};
pub use sync::{HttpTransport, SyncReport, UreqTransport};

use events::Dispatcher;
use pipeline::{Pipeline, PipelineContext, PipelineInput, PipelineView};
use platform::{ModeArbiter, TaskLeases};
use store::{EventLog, LocationStore, LogStore, MemoryStorage, StorageBackend};
use sync::{SyncEngine, SyncTrigger};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeolocationError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location unavailable")]
    LocationUnavailable,
    #[error("Location request timed out")]
    Timeout,
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Sync transport error: {0}")]
    SyncTransportError(String),
    #[error("Sync server answered {0}")]
    SyncServerError(u16),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Not running")]
    NotRunning,
    #[error("Already running")]
    AlreadyRunning,
    #[error("Stop still in progress")]
    Stopping,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl GeolocationError {
    /// Stable numeric code reported to hosts
    pub fn code(&self) -> u32 {
        match self {
            GeolocationError::PermissionDenied => 1,
            GeolocationError::LocationUnavailable => 2,
            GeolocationError::Timeout => 3,
            GeolocationError::ProviderError(_) => 100,
            GeolocationError::SyncTransportError(_) => 200,
            GeolocationError::SyncServerError(_) => 201,
            GeolocationError::StorageError(_) => 300,
            GeolocationError::ConfigError(_) => 400,
            GeolocationError::NotRunning
            | GeolocationError::AlreadyRunning
            | GeolocationError::Stopping
            | GeolocationError::InvalidInput(_) => 500,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<StoreError> for GeolocationError {
    fn from(err: StoreError) -> Self {
        GeolocationError::StorageError(err.to_string())
    }
}

impl From<ConfigError> for GeolocationError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::StorageError(message) => GeolocationError::StorageError(message),
            other => GeolocationError::ConfigError(other.to_string()),
        }
    }
}

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

type FixWaiter = oneshot::Sender<Result<Location, GeolocationError>>;

struct Lifecycle {
    state: PipelineState,
    /// Set only while `state` is Running
    pipeline: Option<Pipeline>,
}

impl Lifecycle {
    fn running(&self) -> Option<&Pipeline> {
        self.pipeline
            .as_ref()
            .filter(|_| self.state == PipelineState::Running)
    }
}

// Leaves the lifecycle Stopped even if a stop is cancelled mid-drain
struct StoppedOnDrop(Arc<Mutex<Lifecycle>>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0.lock().state = PipelineState::Stopped;
    }
}

// ============================================================================
// BACKGROUND GEOLOCATION
// ============================================================================

/// Command surface of the engine.
///
/// Cheap to clone; all clones drive the same engine. Construction and
/// [`start`](Self::start) spawn Tokio tasks and must happen inside a runtime.
#[derive(Clone)]
pub struct BackgroundGeolocation {
    backend: Arc<dyn StorageBackend>,
    store: Arc<LocationStore>,
    logs: Arc<LogStore>,
    config: Arc<ConfigHandle>,
    dispatcher: Dispatcher,
    sync: Arc<SyncEngine>,
    source: Arc<dyn FixSource>,
    arbiter: Arc<RwLock<ModeArbiter>>,
    view: Arc<PipelineView>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    last_fix: Arc<RwLock<Option<Location>>>,
    /// One-shot location requests waiting for the next fix
    waiters: Arc<Mutex<Vec<FixWaiter>>>,
    leases: Arc<TaskLeases>,
}

impl BackgroundGeolocation {
    /// Engine with in-memory storage
    pub fn new(
        source: Arc<dyn FixSource>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, GeolocationError> {
        Self::init(Arc::new(MemoryStorage::new()), source, transport)
    }

    /// Engine persisted under `storage_path`. Falls back to in-memory storage
    /// when the database cannot be opened.
    pub fn with_storage(
        storage_path: &str,
        source: Arc<dyn FixSource>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, GeolocationError> {
        let backend = match store::open_persistent(storage_path) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!(
                    "Storage unavailable at {}: {:#}. Continuing in memory only",
                    storage_path,
                    e
                );
                Arc::new(MemoryStorage::new())
            }
        };
        Self::init(backend, source, transport)
    }

    fn init(
        backend: Arc<dyn StorageBackend>,
        source: Arc<dyn FixSource>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, GeolocationError> {
        let logs = Arc::new(LogStore::open(backend.clone()).map_err(GeolocationError::StorageError)?);
        let config = Arc::new(ConfigHandle::persistent(backend.clone())?);
        let snapshot = config.snapshot();

        logging::init_tracing(logs.clone(), snapshot.config.debug);

        let store = Arc::new(LocationStore::open(backend.clone())?);
        let pending = Arc::new(EventLog::open(backend.clone()).map_err(GeolocationError::StorageError)?);
        let dispatcher = Dispatcher::new(pending);
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            transport,
            config.clone(),
            dispatcher.clone(),
        ));

        let initial_mode = if snapshot.config.start_foreground {
            OperatingMode::Foreground
        } else {
            OperatingMode::Background
        };

        tracing::info!(
            "Geotrack initialized ({} stored location(s), {} mode)",
            store.count()?,
            initial_mode
        );

        Ok(Self {
            backend,
            store,
            logs,
            config,
            dispatcher,
            sync,
            source,
            arbiter: Arc::new(RwLock::new(ModeArbiter::new(initial_mode))),
            view: Arc::new(PipelineView::default()),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: PipelineState::Stopped,
                pipeline: None,
            })),
            last_fix: Arc::new(RwLock::new(None)),
            waiters: Arc::new(Mutex::new(Vec::new())),
            leases: Arc::new(TaskLeases::new()),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Merge `patch` (a JSON object) over the current configuration
    pub fn configure(&self, patch: &serde_json::Value) -> Result<Config, GeolocationError> {
        let snapshot = self.config.apply_patch(patch)?;
        logging::global_ring().set_debug(snapshot.config.debug);
        if let Some(pipeline) = self.lifecycle.lock().running() {
            pipeline.send(PipelineInput::ConfigChanged);
        }
        tracing::info!("Configuration updated (version {})", snapshot.version);
        Ok(snapshot.config.clone())
    }

    pub fn start(&self) -> Result<(), GeolocationError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            PipelineState::Running => return Err(GeolocationError::AlreadyRunning),
            PipelineState::Stopping => return Err(GeolocationError::Stopping),
            PipelineState::Stopped => {}
        }
        if !self.source.authorization().is_authorized() {
            return Err(GeolocationError::PermissionDenied);
        }
        if !self.source.location_services_enabled() {
            tracing::warn!("Starting with location services disabled");
        }

        let ctx = PipelineContext {
            store: self.store.clone(),
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
            sync: self.sync.clone(),
            source: self.source.clone(),
            view: self.view.clone(),
        };
        let mode = self.arbiter.read().mode();
        lifecycle.pipeline = Some(Pipeline::spawn(ctx, mode));
        lifecycle.state = PipelineState::Running;

        tracing::info!("Tracking started");
        self.dispatcher.emit(Event::Start);
        Ok(())
    }

    /// Stop the pipeline. An in-flight sync is abandoned and its batch stays
    /// PENDING. Until the workers have drained, `start` fails with
    /// [`GeolocationError::Stopping`].
    pub async fn stop(&self) -> Result<(), GeolocationError> {
        let pipeline = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != PipelineState::Running {
                return Err(GeolocationError::NotRunning);
            }
            lifecycle.state = PipelineState::Stopping;
            lifecycle.pipeline.take()
        };
        let stopped = StoppedOnDrop(self.lifecycle.clone());
        if let Some(pipeline) = pipeline {
            pipeline.shutdown().await;
        }
        drop(stopped);
        if let Err(e) = self.store.flush() {
            tracing::warn!("Flush on stop failed: {}", e);
        }

        tracing::info!("Tracking stopped");
        self.dispatcher.emit(Event::Stop);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().state == PipelineState::Running
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.lifecycle.lock().state
    }

    /// Stop if running, deliver queued events and release the log ring
    pub async fn close(self) {
        if self.is_running() {
            let _ = self.stop().await;
        }
        self.dispatcher.flush().await;
        if let Err(e) = self.backend.flush() {
            tracing::warn!("Flush on close failed: {}", e);
        }
        logging::global_ring().detach_store(&self.logs);
    }

    /// Device boot: start when `start_on_boot` is set. Returns whether it did.
    pub fn on_boot(&self) -> Result<bool, GeolocationError> {
        if !self.config.snapshot().config.start_on_boot {
            return Ok(false);
        }
        match self.start() {
            Ok(()) => Ok(true),
            Err(GeolocationError::AlreadyRunning) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // LOCATION QUERIES
    // ------------------------------------------------------------------------

    /// One-shot location request.
    ///
    /// Fails with `PermissionDenied` without authorization and with
    /// `LocationUnavailable` when services are off (or go off while
    /// waiting). A cached fix younger than `maximum_age_ms` is returned
    /// directly; otherwise the next fix is awaited up to `timeout_ms`.
    pub async fn get_current_location(&self, options: PositionOptions) -> Result<Location, GeolocationError> {
        if !self.source.authorization().is_authorized() {
            return Err(GeolocationError::PermissionDenied);
        }
        if !self.source.location_services_enabled() {
            return Err(GeolocationError::LocationUnavailable);
        }

        if let Some(maximum_age_ms) = options.maximum_age_ms {
            let cached = self
                .last_fix
                .read()
                .clone()
                .or_else(|| self.source.last_known_location());
            if let Some(fix) = cached {
                if now_ms().saturating_sub(fix.time) <= maximum_age_ms {
                    return Ok(fix);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(tx);
        let outcome = match self.source.request_single_update(options.enable_high_accuracy) {
            Ok(()) => match tokio::time::timeout(Duration::from_millis(options.timeout_ms), rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(GeolocationError::LocationUnavailable),
                Err(_) => Err(GeolocationError::Timeout),
            },
            Err(message) => {
                drop(rx);
                Err(GeolocationError::ProviderError(message))
            }
        };

        // Also drops waiters left behind by callers that were cancelled
        self.waiters.lock().retain(|waiter| !waiter.is_closed());
        outcome
    }

    /// Single-fix requests still waiting for a fix
    pub fn pending_location_requests(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Current stationary region, if the device is stationary
    pub fn get_stationary_location(&self) -> Option<StationaryRegion> {
        self.view.stationary.read().clone()
    }

    pub fn motion_state(&self) -> MotionState {
        *self.view.motion.read()
    }

    pub fn check_status(&self) -> ServiceStatus {
        ServiceStatus {
            is_running: self.is_running(),
            pipeline: self.pipeline_state(),
            location_services_enabled: self.source.location_services_enabled(),
            authorization: self.source.authorization(),
        }
    }

    /// Every stored sample, oldest first
    pub fn get_locations(&self) -> Result<Vec<LocationSample>, GeolocationError> {
        self.get_locations_filtered(&LocationFilter::default())
    }

    pub fn get_locations_filtered(&self, filter: &LocationFilter) -> Result<Vec<LocationSample>, GeolocationError> {
        Ok(self.store.list_all(filter)?)
    }

    /// Samples still awaiting delivery
    pub fn get_valid_locations(&self) -> Result<Vec<LocationSample>, GeolocationError> {
        Ok(self.store.list_pending()?)
    }

    /// Returns false if no sample had this id
    pub fn delete_location(&self, id: u64) -> Result<bool, GeolocationError> {
        Ok(self.store.delete(id)?)
    }

    pub fn delete_all_locations(&self) -> Result<usize, GeolocationError> {
        let deleted = self.store.delete_all()?;
        tracing::info!("Deleted {} location(s)", deleted);
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // MODE, SYNC & CONFIG
    // ------------------------------------------------------------------------

    /// Explicit mode override (0 = BACKGROUND, 1 = FOREGROUND). Host
    /// lifecycle signals no longer change the mode afterwards.
    pub fn switch_mode(&self, mode_id: u8) -> Result<OperatingMode, GeolocationError> {
        let mode = OperatingMode::from_id(mode_id)
            .ok_or_else(|| GeolocationError::InvalidInput(format!("Unknown mode id {}", mode_id)))?;
        let changed = self.arbiter.write().switch_mode(mode);
        if let Some(mode) = changed {
            self.on_mode_changed(mode);
        }
        Ok(mode)
    }

    pub fn mode(&self) -> OperatingMode {
        self.arbiter.read().mode()
    }

    fn on_mode_changed(&self, mode: OperatingMode) {
        tracing::info!("Switched to {} mode", mode);
        if let Some(pipeline) = self.lifecycle.lock().running() {
            pipeline.send(PipelineInput::ModeChanged(mode));
        }
        self.dispatcher.emit(match mode {
            OperatingMode::Foreground => Event::Foreground,
            OperatingMode::Background => Event::Background,
        });
    }

    /// Deliver everything pending now, in one batch
    pub async fn force_sync(&self) -> Result<SyncReport, GeolocationError> {
        let report = self.sync.trigger(SyncTrigger::Force).await;
        match &report.error {
            Some(err) => Err(err.clone()),
            None => Ok(report),
        }
    }

    pub fn get_config(&self) -> Config {
        self.config.snapshot().config.clone()
    }

    /// Log entries with id above `from_id` and level at least `min_level`
    pub fn get_log_entries(
        &self,
        limit: usize,
        from_id: u64,
        min_level: LogLevel,
    ) -> Result<Vec<LogEntry>, GeolocationError> {
        self.logs
            .entries(limit, from_id, min_level)
            .map_err(GeolocationError::StorageError)
    }

    // ------------------------------------------------------------------------
    // EVENTS & TASKS
    // ------------------------------------------------------------------------

    pub fn on(&self, event_name: &str, callback: Observer) -> Result<(), GeolocationError> {
        let name = event_name
            .parse::<EventName>()
            .map_err(GeolocationError::InvalidInput)?;
        self.dispatcher.on(name, callback);
        Ok(())
    }

    pub fn remove_all_listeners(&self, event_name: &str) -> Result<usize, GeolocationError> {
        let name = event_name
            .parse::<EventName>()
            .map_err(GeolocationError::InvalidInput)?;
        Ok(self.dispatcher.remove_all_listeners(name))
    }

    /// Register the handler used while the host is not resident
    pub fn headless_task(&self, handler: HeadlessHandler) {
        self.dispatcher.set_headless(handler);
    }

    /// Wait until every event emitted so far has been delivered
    pub async fn flush_events(&self) {
        self.dispatcher.flush().await;
    }

    pub fn start_task(&self) -> u64 {
        self.leases.start()
    }

    pub fn end_task(&self, key: u64) -> bool {
        self.leases.end(key)
    }

    pub fn active_tasks(&self) -> usize {
        self.leases.active_count()
    }

    // ------------------------------------------------------------------------
    // PLATFORM INPUTS
    // ------------------------------------------------------------------------

    /// A raw fix from the provider
    pub fn on_raw_fix(&self, fix: Location) {
        *self.last_fix.write() = Some(fix.clone());

        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(Ok(fix.clone()));
        }

        if let Some(pipeline) = self.lifecycle.lock().running() {
            pipeline.send(PipelineInput::Fix(fix));
        }
    }

    /// An activity observation from the activity source
    pub fn on_activity(&self, observation: ActivityObservation) {
        if let Some(pipeline) = self.lifecycle.lock().running() {
            pipeline.send(PipelineInput::Activity(observation));
        }
    }

    /// Wait until every input handed over so far has been processed and
    /// the resulting events delivered
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .lifecycle
            .lock()
            .running()
            .map_or(false, |pipeline| pipeline.send(PipelineInput::Barrier(tx)));
        if sent {
            let _ = rx.await;
        }
        self.dispatcher.flush().await;
    }

    pub fn on_provider_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::ServicesEnabled(true) => tracing::info!("Location services enabled"),
            ProviderEvent::ServicesEnabled(false) => {
                tracing::warn!("Location services disabled");
                self.fail_waiters(GeolocationError::LocationUnavailable);
            }
            ProviderEvent::Authorization(status) => {
                tracing::info!("Authorization changed: {:?}", status);
                if !status.is_authorized() {
                    self.fail_waiters(GeolocationError::PermissionDenied);
                }
                self.dispatcher.emit(Event::Authorization(status));
            }
            ProviderEvent::Error(message) => {
                let err = GeolocationError::ProviderError(message);
                tracing::error!("{}", err);
                self.dispatcher.emit(Event::Error(err.payload()));
            }
        }
    }

    fn fail_waiters(&self, err: GeolocationError) {
        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Host lifecycle signal
    pub async fn on_host_signal(&self, signal: HostSignal) {
        match signal {
            HostSignal::Resumed | HostSignal::Backgrounded => {
                if signal == HostSignal::Resumed {
                    self.dispatcher.host_attached();
                }
                let changed = self.arbiter.write().on_lifecycle(signal);
                if let Some(mode) = changed {
                    self.on_mode_changed(mode);
                }
            }
            HostSignal::Terminated => {
                if self.config.snapshot().config.stop_on_terminate {
                    tracing::info!("Host terminated, stopping");
                    let _ = self.stop().await;
                } else {
                    tracing::info!("Host terminated, continuing headless");
                }
                self.dispatcher.host_detached();
            }
            HostSignal::AbortRequested => {
                tracing::warn!("Abort requested by the OS, flushing state");
                self.dispatcher.emit(Event::AbortRequested);
                if let Err(e) = self.store.flush() {
                    tracing::error!("Flush on abort failed: {}", e);
                }
                if let Err(e) = self.backend.flush() {
                    tracing::error!("Flush on abort failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GeolocationError::PermissionDenied.code(), 1);
        assert_eq!(GeolocationError::LocationUnavailable.code(), 2);
        assert_eq!(GeolocationError::Timeout.code(), 3);
        assert_eq!(GeolocationError::ProviderError("x".into()).code(), 100);
        assert_eq!(GeolocationError::SyncTransportError("x".into()).code(), 200);
        assert_eq!(GeolocationError::SyncServerError(500).code(), 201);
        assert_eq!(GeolocationError::StorageError("x".into()).code(), 300);
        assert_eq!(GeolocationError::ConfigError("x".into()).code(), 400);
        assert_eq!(GeolocationError::AlreadyRunning.code(), 500);
        assert_eq!(GeolocationError::Stopping.code(), 500);

        let payload = GeolocationError::SyncServerError(503).payload();
        assert_eq!(payload.code, 201);
        assert_eq!(payload.message, "Sync server answered 503");
    }

    #[test]
    fn test_config_error_conversion() {
        let err: GeolocationError = ConfigError::Invalid("bad radius".into()).into();
        assert_eq!(err.code(), 400);
        let err: GeolocationError = ConfigError::StorageError("disk".into()).into();
        assert_eq!(err, GeolocationError::StorageError("disk".into()));
    }
}
