//! Sync engine
//!
//! Ships unsynced samples to the collector in oldest-first batches.
//!
//! Per batch: the samples are moved back to PENDING, rendered into one JSON
//! array and POSTed to `url`. A 2xx marks them SYNCED; anything else marks
//! them FAILED and ends the cycle, so a newer batch is never delivered ahead
//! of an older failed one. The engine never deletes samples.
//!
//! At most one run is in flight. Callers arriving while a run is active join
//! it and receive its report. A forced caller that joined a periodic or
//! threshold run starts a forced run of its own once that one ends, so
//! whatever is still pending then goes out in a single batch.

use super::template::render_batch;
use super::transport::{HttpRequest, HttpTransport};
use crate::config::{Config, ConfigHandle};
use crate::events::{Dispatcher, Event};
use crate::location::{LocationSample, SyncStatus};
use crate::store::LocationStore;
use crate::GeolocationError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Timer driven, runs whenever anything is pending
    Periodic,
    /// Pending count reached `sync_threshold`
    Threshold,
    /// Explicit request: everything pending, one batch
    Force,
}

/// Outcome of one sync run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Batches delivered
    pub batches: usize,
    pub synced: usize,
    pub failed: usize,
    /// Failure that ended the run
    pub error: Option<GeolocationError>,
}

impl SyncReport {
    fn merge(self, later: SyncReport) -> SyncReport {
        SyncReport {
            batches: self.batches + later.batches,
            synced: self.synced + later.synced,
            failed: self.failed + later.failed,
            error: later.error.or(self.error),
        }
    }
}

type SyncRun = Shared<BoxFuture<'static, SyncReport>>;

struct InFlight {
    trigger: SyncTrigger,
    run: SyncRun,
}

pub struct SyncEngine {
    store: Arc<LocationStore>,
    transport: Arc<dyn HttpTransport>,
    config: Arc<ConfigHandle>,
    dispatcher: Dispatcher,
    in_flight: Mutex<Option<InFlight>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocationStore>,
        transport: Arc<dyn HttpTransport>,
        config: Arc<ConfigHandle>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            dispatcher,
            in_flight: Mutex::new(None),
        }
    }

    /// Run a sync, or join the one already in flight
    pub async fn trigger(self: &Arc<Self>, trigger: SyncTrigger) -> SyncReport {
        let mut earlier: Option<SyncReport> = None;
        loop {
            let (joined, run) = self.join_or_start(trigger);
            let report = run.await;
            self.clear_finished();

            let report = match earlier.take() {
                Some(earlier) => earlier.merge(report),
                None => report,
            };
            if trigger == SyncTrigger::Force && joined != SyncTrigger::Force && report.error.is_none() {
                debug!("Joined a {:?} sync, following up with a forced one", joined);
                earlier = Some(report);
                continue;
            }
            return report;
        }
    }

    // Returns the trigger of the run actually awaited
    fn join_or_start(self: &Arc<Self>, trigger: SyncTrigger) -> (SyncTrigger, SyncRun) {
        let mut in_flight = self.in_flight.lock();
        match in_flight.as_ref() {
            Some(current) if current.run.peek().is_none() => {
                debug!("Sync already in flight, joining ({:?})", trigger);
                (current.trigger, current.run.clone())
            }
            _ => {
                let engine = Arc::clone(self);
                let run = async move { engine.run(trigger).await }.boxed().shared();
                *in_flight = Some(InFlight {
                    trigger,
                    run: run.clone(),
                });
                (trigger, run)
            }
        }
    }

    fn clear_finished(&self) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .as_ref()
            .map_or(false, |current| current.run.peek().is_some())
        {
            *in_flight = None;
        }
    }

    /// Forget the in-flight run. Its current batch stays PENDING.
    pub fn abandon(&self) {
        if self.in_flight.lock().take().is_some() {
            debug!("In-flight sync abandoned");
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .map_or(false, |current| current.run.peek().is_none())
    }

    async fn run(self: Arc<Self>, trigger: SyncTrigger) -> SyncReport {
        let snapshot = self.config.snapshot();
        let config = &snapshot.config;
        let mut report = SyncReport::default();

        let Some(url) = config.url.clone() else {
            debug!("No sync url configured, skipping {:?} sync", trigger);
            return report;
        };

        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                let err = GeolocationError::from(e);
                self.report_error(&err);
                report.error = Some(err);
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }

        let threshold = config.sync_threshold.max(1) as usize;
        if trigger == SyncTrigger::Threshold && pending.len() < threshold {
            return report;
        }
        let batch_size = match trigger {
            SyncTrigger::Force => pending.len(),
            SyncTrigger::Periodic | SyncTrigger::Threshold => threshold,
        };

        info!(
            "Syncing {} location(s) in batches of {} ({:?})",
            pending.len(),
            batch_size,
            trigger
        );

        for batch in pending.chunks(batch_size) {
            match self.send_batch(&url, batch, config).await {
                Ok(()) => {
                    report.batches += 1;
                    report.synced += batch.len();
                }
                Err(err) => {
                    report.failed += batch.len();
                    self.report_error(&err);
                    report.error = Some(err);
                    break;
                }
            }
        }
        report
    }

    async fn send_batch(
        &self,
        url: &str,
        batch: &[LocationSample],
        config: &Config,
    ) -> Result<(), GeolocationError> {
        let ids: Vec<u64> = batch.iter().map(|sample| sample.id).collect();
        let previously_failed: Vec<LocationSample> = batch
            .iter()
            .filter(|sample| sample.status == SyncStatus::Failed)
            .cloned()
            .collect();

        self.store.mark_pending(&ids)?;

        let request = HttpRequest {
            url: url.to_string(),
            headers: config.http_headers.clone(),
            body: render_batch(batch, config.post_template.as_ref()),
        };

        match self.transport.post_json(request).await {
            Ok(response) if response.is_success() => {
                self.store.mark_synced(&ids)?;
                debug!("Batch of {} delivered ({})", ids.len(), response.status);
                if let Some(sync_url) = &config.sync_url {
                    if !previously_failed.is_empty() {
                        self.forward_failed(sync_url, &previously_failed, config).await;
                    }
                }
                Ok(())
            }
            Ok(response) => {
                self.store.mark_failed(&ids)?;
                if response.status == 401 {
                    self.dispatcher.emit(Event::HttpAuthorization {
                        status: response.status,
                    });
                }
                Err(GeolocationError::SyncServerError(response.status))
            }
            Err(e) => {
                self.store.mark_failed(&ids)?;
                Err(GeolocationError::SyncTransportError(e.to_string()))
            }
        }
    }

    /// Copy deliveries that had failed before to the secondary endpoint
    async fn forward_failed(&self, sync_url: &str, samples: &[LocationSample], config: &Config) {
        let request = HttpRequest {
            url: sync_url.to_string(),
            headers: config.http_headers.clone(),
            body: render_batch(samples, config.post_template.as_ref()),
        };
        match self.transport.post_json(request).await {
            Ok(response) if response.is_success() => {
                debug!("Forwarded {} recovered location(s) to sync url", samples.len());
            }
            Ok(response) => warn!("Sync url answered {}", response.status),
            Err(e) => warn!("Sync url unreachable: {}", e),
        }
    }

    fn report_error(&self, err: &GeolocationError) {
        warn!("Sync failed: {}", err);
        self.dispatcher.emit(Event::Error(err.payload()));
    }
}
