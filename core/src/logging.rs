//! Tracing setup and the persistent log ring
//!
//! Engine code logs with plain `tracing` macros. [`LogRingLayer`] copies
//! events whose target belongs to this workspace into the [`LogStore`] so
//! hosts can read them back with `get_log_entries`.

use crate::store::{LogLevel, LogStore};
use parking_lot::RwLock;
use std::cell::Cell;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const TARGET_PREFIX: &str = "geotrack";

thread_local! {
    // Storage writes may log themselves
    static IN_RING: Cell<bool> = const { Cell::new(false) };
}

/// Shared handle to the log store currently receiving entries
#[derive(Clone, Default)]
pub struct LogRing {
    store: Arc<RwLock<Option<Arc<LogStore>>>>,
    debug: Arc<AtomicBool>,
}

impl LogRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route entries into `store`
    pub fn attach(&self, store: Arc<LogStore>) {
        *self.store.write() = Some(store);
    }

    /// Stop routing into `store` if it is the current target
    pub fn detach_store(&self, store: &Arc<LogStore>) {
        let mut current = self.store.write();
        if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, store)) {
            *current = None;
        }
    }

    /// Record DEBUG entries too (otherwise INFO and above)
    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    pub fn layer(&self) -> LogRingLayer {
        LogRingLayer { ring: self.clone() }
    }

    fn min_level(&self) -> Level {
        if self.debug.load(Ordering::Relaxed) {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}

pub struct LogRingLayer {
    ring: LogRing,
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(TARGET_PREFIX) || *metadata.level() > self.ring.min_level() {
            return;
        }
        let Some(store) = self.ring.store.read().clone() else {
            return;
        };
        if IN_RING.with(|flag| flag.replace(true)) {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        // Logging must never fail the caller
        let _ = store.append(
            crate::now_ms(),
            level_of(metadata.level()),
            visitor.message,
            visitor.stack,
        );

        IN_RING.with(|flag| flag.set(false));
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    stack: Option<String>,
}

impl EntryVisitor {
    fn push_field(&mut self, name: &str, value: &str) {
        match name {
            "message" => {
                let rest = std::mem::take(&mut self.message);
                self.message = value.to_string();
                self.message.push_str(&rest);
            }
            "stack" => self.stack = Some(value.to_string()),
            _ => {
                let _ = write!(self.message, " {}={}", name, value);
            }
        }
    }
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push_field(field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push_field(field.name(), &format!("{:?}", value));
    }
}

static GLOBAL_RING: OnceLock<LogRing> = OnceLock::new();

/// Process-wide ring used by the installed subscriber
pub fn global_ring() -> LogRing {
    GLOBAL_RING.get_or_init(LogRing::new).clone()
}

/// Install the default subscriber (idempotent) and route the ring into `logs`.
///
/// The fmt output honours `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(logs: Arc<LogStore>, debug: bool) {
    let ring = global_ring();
    ring.attach(logs);
    ring.set_debug(debug);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(ring.layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use tracing_subscriber::Registry;

    fn ring_with_store() -> (LogRing, Arc<LogStore>) {
        let store = Arc::new(LogStore::open(Arc::new(MemoryStorage::new())).unwrap());
        let ring = LogRing::new();
        ring.attach(store.clone());
        (ring, store)
    }

    #[test]
    fn test_events_land_in_ring() {
        let (ring, store) = ring_with_store();
        let subscriber = Registry::default().with(ring.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "geotrack_core::test", "Tracking started");
            tracing::error!(target: "geotrack_core::test", stack = "frame 0", "Sync failed: {}", 500);
            tracing::debug!(target: "geotrack_core::test", "Not recorded without debug");
            tracing::info!(target: "sled::tree", "Foreign target");
        });

        let entries = store.entries(10, 0, LogLevel::Trace).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Tracking started");
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].message, "Sync failed: 500");
        assert_eq!(entries[1].stack_trace.as_deref(), Some("frame 0"));

        ring.detach_store(&store);
        tracing::subscriber::with_default(Registry::default().with(ring.layer()), || {
            tracing::info!(target: "geotrack_core::test", "After detach");
        });
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_debug_switch() {
        let (ring, store) = ring_with_store();
        ring.set_debug(true);
        let subscriber = Registry::default().with(ring.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(target: "geotrack_core::test", count = 3, "Fix dropped");
        });

        let entries = store.entries(10, 0, LogLevel::Trace).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Debug);
        assert_eq!(entries[0].message, "Fix dropped count=3");
    }
}
