// Tracking pipeline: ingestion and sync workers
//
// The ingestion worker owns the classifier, the sampling controller and its
// copy of the mode. It is the only writer of new samples. The sync worker
// runs separately so a stalled POST never holds up ingestion. Both stop on
// the shared watch signal.

use crate::config::{Config, ConfigHandle};
use crate::events::{Dispatcher, Event};
use crate::location::{Location, LocationSample, StationaryRegion, SyncStatus};
use crate::motion::{ActivityObservation, MotionClassifier, MotionState, MotionTransition};
use crate::platform::{FixSource, OperatingMode};
use crate::sampling::{ProviderRequest, SamplingController, SamplingDecision};
use crate::store::LocationStore;
use crate::sync::{SyncEngine, SyncTrigger};
use crate::{now_ms, GeolocationError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often the quiescence window is checked
pub const QUIESCENCE_TICK: Duration = Duration::from_secs(1);

/// Floor for the periodic sync cadence
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum PipelineInput {
    Fix(Location),
    Activity(ActivityObservation),
    ModeChanged(OperatingMode),
    /// Configuration was replaced, re-derive the provider request
    ConfigChanged,
    /// Answered once every earlier input has been handled
    Barrier(oneshot::Sender<()>),
}

/// State the pipeline publishes for the command surface
#[derive(Debug)]
pub struct PipelineView {
    pub stationary: RwLock<Option<StationaryRegion>>,
    pub motion: RwLock<MotionState>,
}

impl Default for PipelineView {
    fn default() -> Self {
        Self {
            stationary: RwLock::new(None),
            motion: RwLock::new(MotionState::Unknown),
        }
    }
}

/// Everything the workers share with the command surface
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<LocationStore>,
    pub config: Arc<ConfigHandle>,
    pub dispatcher: Dispatcher,
    pub sync: Arc<SyncEngine>,
    pub source: Arc<dyn FixSource>,
    pub view: Arc<PipelineView>,
}

/// Handle to the running workers
pub struct Pipeline {
    input: mpsc::UnboundedSender<PipelineInput>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn both workers. Must be called from within a Tokio runtime.
    pub fn spawn(ctx: PipelineContext, mode: OperatingMode) -> Self {
        let (input, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sync_now = Arc::new(Notify::new());

        let ingestion = Ingestion {
            ctx: ctx.clone(),
            classifier: MotionClassifier::new(),
            sampler: SamplingController::new(),
            mode,
            last_request: None,
            sync_now: sync_now.clone(),
        };

        let workers = vec![
            tokio::spawn(ingestion.run(receiver, shutdown_rx.clone())),
            tokio::spawn(sync_loop(
                ctx.sync.clone(),
                ctx.config.clone(),
                sync_now,
                shutdown_rx,
            )),
        ];

        Self {
            input,
            shutdown,
            workers,
        }
    }

    pub fn send(&self, input: PipelineInput) -> bool {
        self.input.send(input).is_ok()
    }

    /// Stop both workers and wait for them to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Pipeline worker ended abnormally: {}", e);
            }
        }
    }
}

// ============================================================================
// INGESTION WORKER
// ============================================================================

struct Ingestion {
    ctx: PipelineContext,
    classifier: MotionClassifier,
    sampler: SamplingController,
    mode: OperatingMode,
    /// Last request handed to the fix source, None while updates are stopped
    last_request: Option<ProviderRequest>,
    sync_now: Arc<Notify>,
}

impl Ingestion {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<PipelineInput>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(QUIESCENCE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let snapshot = self.ctx.config.snapshot();
        self.apply_request(&snapshot.config);
        info!("Ingestion worker started in {} mode", self.mode);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                input = receiver.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
                _ = tick.tick() => {
                    let snapshot = self.ctx.config.snapshot();
                    if let Some(transition) = self.classifier.on_tick(now_ms(), &snapshot.config) {
                        self.on_transition(transition);
                        self.apply_request(&snapshot.config);
                    }
                }
            }
        }

        self.ctx.source.stop_updates();
        info!("Ingestion worker stopped");
    }

    fn handle(&mut self, input: PipelineInput) {
        // One snapshot per processing cycle
        let snapshot = self.ctx.config.snapshot();
        let config = &snapshot.config;

        match input {
            PipelineInput::Fix(fix) => self.on_fix(fix, config),
            PipelineInput::Activity(observation) => {
                self.ctx.dispatcher.emit(Event::Activity(observation));
                if let Some(transition) = self.classifier.on_activity(&observation, config) {
                    self.on_transition(transition);
                    self.apply_request(config);
                }
            }
            PipelineInput::ModeChanged(mode) => {
                self.mode = mode;
                self.apply_request(config);
            }
            PipelineInput::ConfigChanged => self.apply_request(config),
            PipelineInput::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_fix(&mut self, fix: Location, config: &Config) {
        let state_before = self.classifier.state();
        if let Some(transition) = self.classifier.on_fix(&fix, now_ms(), config) {
            self.on_transition(transition);
        }
        *self.ctx.view.motion.write() = self.classifier.state();

        match self.sampler.on_raw_fix(&fix, self.mode, config) {
            SamplingDecision::Accept => self.persist(&fix, config),
            SamplingDecision::Drop { distance_m, elapsed_ms } => {
                debug!(
                    "Fix dropped: {:.1} m / {} ms since last sample",
                    distance_m, elapsed_ms
                );
            }
        }

        if self.classifier.state() != state_before {
            self.apply_request(config);
        }
    }

    fn persist(&mut self, fix: &Location, config: &Config) {
        let location = SamplingController::sample_from_fix(fix, config);
        let id = match self.ctx.store.append(location.clone(), config.max_locations) {
            Ok(id) => id,
            Err(e) => {
                let err = GeolocationError::from(e);
                error!("Failed to persist location: {}", err);
                self.ctx.dispatcher.emit(Event::Error(err.payload()));
                return;
            }
        };

        self.ctx.dispatcher.emit(Event::Location(LocationSample {
            id,
            location,
            status: SyncStatus::Pending,
        }));

        if config.url.is_some() {
            match self.ctx.store.pending_count() {
                Ok(pending) if pending >= config.sync_threshold.max(1) as usize => {
                    self.sync_now.notify_one();
                }
                Ok(_) => {}
                Err(e) => warn!("Could not count pending locations: {}", e),
            }
        }
    }

    fn on_transition(&mut self, transition: MotionTransition) {
        match transition {
            MotionTransition::StartMoving => {
                info!("Device started moving");
                *self.ctx.view.stationary.write() = None;
                self.ctx.dispatcher.emit(Event::StartMoving);
            }
            MotionTransition::Stationary(region) => {
                info!(
                    "Device stationary at {:.6},{:.6} (radius {} m)",
                    region.anchor.latitude, region.anchor.longitude, region.radius
                );
                *self.ctx.view.stationary.write() = Some(region.clone());
                self.ctx.dispatcher.emit(Event::Stationary(region));
            }
        }
        *self.ctx.view.motion.write() = self.classifier.state();
    }

    /// Hand the fix source the request for the current mode and motion
    fn apply_request(&mut self, config: &Config) {
        if self.mode == OperatingMode::Background && config.pause_location_updates {
            if self.last_request.take().is_some() {
                debug!("Background with paused updates, stopping provider");
                self.ctx.source.stop_updates();
            }
            return;
        }

        let request = self
            .sampler
            .desired_request(self.mode, self.classifier.state(), config);
        if self.last_request == Some(request) {
            return;
        }
        debug!("Provider request: {:?}", request);
        match self.ctx.source.request_updates(&request) {
            Ok(()) => self.last_request = Some(request),
            Err(message) => {
                let err = GeolocationError::ProviderError(message);
                warn!("Provider rejected request: {}", err);
                self.ctx.dispatcher.emit(Event::Error(err.payload()));
            }
        }
    }
}

// ============================================================================
// SYNC WORKER
// ============================================================================

fn sync_period(config: &ConfigHandle) -> Duration {
    Duration::from_millis(config.snapshot().config.sync_interval_ms).max(MIN_SYNC_INTERVAL)
}

async fn sync_loop(
    sync: Arc<SyncEngine>,
    config: Arc<ConfigHandle>,
    sync_now: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut period = sync_period(&config);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => SyncTrigger::Periodic,
            _ = sync_now.notified() => SyncTrigger::Threshold,
        };

        tokio::select! {
            _ = shutdown.changed() => {
                sync.abandon();
                break;
            }
            report = sync.trigger(trigger) => {
                if report.batches > 0 || report.error.is_some() {
                    debug!("{:?} sync: {:?}", trigger, report);
                }
            }
        }

        let current = sync_period(&config);
        if current != period {
            period = current;
            ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
    }
    debug!("Sync worker stopped");
}
