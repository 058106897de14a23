//! Event dispatcher
//!
//! Every emitted [`Event`] goes through one unbounded channel to a single
//! delivery task, so observers see events in emission order and a slow
//! observer never blocks the ingestion worker.
//!
//! The host counts as resident once it registers an observer with
//! [`Dispatcher::on`] or reports that it resumed. Until then, and again after
//! it detaches, events go to the headless handler as `(name, params)`. With
//! no headless handler registered yet they are appended to the durable
//! [`EventLog`] and replayed when one is. A process started by the OS
//! (boot, relaunch) therefore delivers headlessly from its first event.

use super::types::{Event, EventName};
use crate::store::EventLog;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Live observer callback
pub type Observer = Arc<dyn Fn(&Event) + Send + Sync>;

/// Headless handler: event name and plain JSON payload
pub type HeadlessHandler = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

enum Delivery {
    Event(Event),
    /// Replay the pending log to this handler, then make it current
    SetHeadless(HeadlessHandler),
    /// Host went away: drop every live observer
    Detach,
    Attach,
    Flush(oneshot::Sender<()>),
}

struct Registry {
    observers: HashMap<EventName, Vec<Observer>>,
    headless: Option<HeadlessHandler>,
    host_resident: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<Registry>>,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its delivery task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(pending: Arc<EventLog>) -> Self {
        let registry = Arc::new(RwLock::new(Registry {
            observers: HashMap::new(),
            headless: None,
            host_resident: false,
        }));
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(delivery_loop(registry.clone(), pending, receiver));

        Self { registry, sender }
    }

    /// Register an observer for `name`. Registering marks the host resident
    /// for every event emitted after this call.
    pub fn on(&self, name: EventName, observer: Observer) {
        self.registry
            .write()
            .observers
            .entry(name)
            .or_default()
            .push(observer);
        self.send(Delivery::Attach);
    }

    /// Remove every observer registered for `name`
    pub fn remove_all_listeners(&self, name: EventName) -> usize {
        self.registry
            .write()
            .observers
            .remove(&name)
            .map_or(0, |observers| observers.len())
    }

    pub fn listener_count(&self, name: EventName) -> usize {
        self.registry
            .read()
            .observers
            .get(&name)
            .map_or(0, Vec::len)
    }

    pub fn emit(&self, event: Event) {
        self.send(Delivery::Event(event));
    }

    /// Register the headless handler. Events logged while nobody could
    /// receive them are replayed to it first.
    pub fn set_headless(&self, handler: HeadlessHandler) {
        self.send(Delivery::SetHeadless(handler));
    }

    /// The host is no longer resident. Live observers are dropped.
    pub fn host_detached(&self) {
        self.send(Delivery::Detach);
    }

    /// The host is resident again
    pub fn host_attached(&self) {
        self.send(Delivery::Attach);
    }

    /// Residency as seen by the delivery task. Call [`Dispatcher::flush`]
    /// first to observe the effect of earlier calls.
    pub fn is_host_resident(&self) -> bool {
        self.registry.read().host_resident
    }

    /// Wait until everything emitted before this call has been delivered
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Delivery::Flush(tx));
        let _ = rx.await;
    }

    fn send(&self, delivery: Delivery) {
        if self.sender.send(delivery).is_err() {
            warn!("Event delivery task is gone, dropping event");
        }
    }
}

async fn delivery_loop(
    registry: Arc<RwLock<Registry>>,
    pending: Arc<EventLog>,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = receiver.recv().await {
        match delivery {
            Delivery::Event(event) => deliver(&registry, &pending, &event),
            Delivery::SetHeadless(handler) => {
                match pending.drain() {
                    Ok(events) => {
                        if !events.is_empty() {
                            debug!("Replaying {} pending event(s) to headless handler", events.len());
                        }
                        for event in events {
                            let params = serde_json::from_str(&event.params)
                                .unwrap_or(serde_json::Value::Null);
                            call_headless(&handler, &event.name, &params);
                        }
                    }
                    Err(e) => error!("Failed to read pending events: {}", e),
                }
                registry.write().headless = Some(handler);
            }
            Delivery::Detach => {
                let mut registry = registry.write();
                registry.host_resident = false;
                registry.observers.clear();
                debug!("Host detached, live observers dropped");
            }
            Delivery::Attach => registry.write().host_resident = true,
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn deliver(registry: &RwLock<Registry>, pending: &EventLog, event: &Event) {
    let name = event.name();
    let (resident, observers, headless) = {
        let registry = registry.read();
        (
            registry.host_resident,
            registry.observers.get(&name).cloned().unwrap_or_default(),
            registry.headless.clone(),
        )
    };

    if resident {
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                warn!("Observer for '{}' panicked", name);
            }
        }
        return;
    }

    let params = event.params();
    match headless {
        Some(handler) => call_headless(&handler, name.as_str(), &params),
        None => {
            if let Err(e) = pending.append(name.as_str(), &params) {
                error!("Failed to persist pending '{}' event: {}", name, e);
            }
        }
    }
}

fn call_headless(handler: &HeadlessHandler, name: &str, params: &serde_json::Value) {
    if catch_unwind(AssertUnwindSafe(|| handler(name, params))).is_err() {
        warn!("Headless handler panicked on '{}'", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use parking_lot::Mutex;

    fn dispatcher() -> (Dispatcher, Arc<EventLog>) {
        let log = Arc::new(EventLog::open(Arc::new(MemoryStorage::new())).unwrap());
        (Dispatcher::new(log.clone()), log)
    }

    fn recorder(dispatcher: &Dispatcher, name: EventName) -> Arc<Mutex<Vec<EventName>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.on(name, Arc::new(move |event: &Event| sink.lock().push(event.name())));
        seen
    }

    #[tokio::test]
    async fn test_delivers_in_order_to_matching_observers() {
        let (dispatcher, _) = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in [EventName::Start, EventName::Stop] {
            let sink = order.clone();
            dispatcher.on(name, Arc::new(move |event: &Event| sink.lock().push(event.name())));
        }
        let others = recorder(&dispatcher, EventName::Location);

        dispatcher.emit(Event::Start);
        dispatcher.emit(Event::Stop);
        dispatcher.emit(Event::Start);
        dispatcher.flush().await;

        assert_eq!(
            *order.lock(),
            vec![EventName::Start, EventName::Stop, EventName::Start]
        );
        assert!(others.lock().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_others() {
        let (dispatcher, _) = dispatcher();
        dispatcher.on(EventName::Start, Arc::new(|_: &Event| panic!("observer failure")));
        let seen = recorder(&dispatcher, EventName::Start);

        dispatcher.emit(Event::Start);
        dispatcher.emit(Event::Start);
        dispatcher.flush().await;

        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_all_listeners() {
        let (dispatcher, _) = dispatcher();
        let seen = recorder(&dispatcher, EventName::Stop);
        let _also = recorder(&dispatcher, EventName::Stop);

        assert_eq!(dispatcher.remove_all_listeners(EventName::Stop), 2);
        assert_eq!(dispatcher.listener_count(EventName::Stop), 0);

        dispatcher.emit(Event::Stop);
        dispatcher.flush().await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_not_resident_until_an_observer_registers() {
        let (dispatcher, log) = dispatcher();
        assert!(!dispatcher.is_host_resident());

        dispatcher.emit(Event::Start);
        dispatcher.flush().await;
        assert_eq!(log.len().unwrap(), 1);

        let live = recorder(&dispatcher, EventName::Stop);
        dispatcher.emit(Event::Stop);
        dispatcher.flush().await;

        assert!(dispatcher.is_host_resident());
        assert_eq!(*live.lock(), vec![EventName::Stop]);
        assert_eq!(log.len().unwrap(), 1);

        dispatcher.host_detached();
        dispatcher.flush().await;
        assert!(!dispatcher.is_host_resident());
        dispatcher.host_attached();
        dispatcher.flush().await;
        assert!(dispatcher.is_host_resident());
    }

    #[tokio::test]
    async fn test_fresh_process_delivers_to_headless_handler() {
        let (dispatcher, log) = dispatcher();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        dispatcher.set_headless(Arc::new(move |name: &str, _: &serde_json::Value| {
            sink.lock().push(name.to_string())
        }));

        dispatcher.emit(Event::Start);
        dispatcher.emit(Event::Stop);
        dispatcher.flush().await;

        assert_eq!(*received.lock(), vec!["start", "stop"]);
        assert!(log.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_detached_events_are_logged_then_replayed() {
        let (dispatcher, log) = dispatcher();
        let live = recorder(&dispatcher, EventName::Start);

        dispatcher.host_detached();
        dispatcher.emit(Event::Start);
        dispatcher.emit(Event::Stop);
        dispatcher.flush().await;

        assert!(live.lock().is_empty());
        assert_eq!(dispatcher.listener_count(EventName::Start), 0);
        assert_eq!(log.len().unwrap(), 2);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        dispatcher.set_headless(Arc::new(move |name: &str, _: &serde_json::Value| {
            sink.lock().push(name.to_string())
        }));
        dispatcher.emit(Event::Foreground);
        dispatcher.flush().await;

        assert_eq!(*received.lock(), vec!["start", "stop", "foreground"]);
        assert!(log.is_empty().unwrap());
    }
}
