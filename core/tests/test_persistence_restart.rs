use geotrack_core::store::{EventLog, LogStore, SledStorage, StorageBackend};
use geotrack_core::sync::{HttpRequest, HttpResponse, TransportError};
use geotrack_core::{
    AuthorizationStatus, BackgroundGeolocation, FixSource, HostSignal, HttpTransport, Location,
    LogLevel, ProviderRequest, SyncStatus,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct StaticFixSource;

impl FixSource for StaticFixSource {
    fn request_updates(&self, _request: &ProviderRequest) -> Result<(), String> {
        Ok(())
    }

    fn stop_updates(&self) {}

    fn request_single_update(&self, _high_accuracy: bool) -> Result<(), String> {
        Ok(())
    }

    fn location_services_enabled(&self) -> bool {
        true
    }

    fn authorization(&self) -> AuthorizationStatus {
        AuthorizationStatus::Authorized
    }

    fn last_known_location(&self) -> Option<Location> {
        None
    }
}

struct Unreachable;

#[async_trait::async_trait]
impl HttpTransport for Unreachable {
    async fn post_json(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Err(TransportError::Connection("offline".into()))
    }
}

fn open(path: &str) -> BackgroundGeolocation {
    BackgroundGeolocation::with_storage(path, Arc::new(StaticFixSource), Arc::new(Unreachable))
        .unwrap()
}

/// Close and give the event delivery task time to release the database
async fn shut(engine: BackgroundGeolocation) {
    engine.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn fix(n: u64) -> Location {
    Location::new("gps", n, 40.0 + n as f64 * 0.01, -3.7).with_accuracy(4.0)
}

async fn wait_for_count(engine: &BackgroundGeolocation, count: usize) {
    for _ in 0..300 {
        if engine.get_locations().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("locations never reached {}", count);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    {
        let engine = open(path);
        engine
            .configure(&json!({ "distance_filter": 25.0, "url": "http://collector.test/" }))
            .unwrap();
        engine.start().unwrap();
        for n in 1..=3 {
            engine.on_raw_fix(fix(n));
        }
        wait_for_count(&engine, 3).await;

        // Offline collector leaves the batch FAILED
        assert!(engine.force_sync().await.is_err());
        assert!(engine.delete_location(3).unwrap());
        shut(engine).await;
    }

    {
        let engine = open(path);
        let config = engine.get_config();
        assert_eq!(config.distance_filter, 25.0);
        assert_eq!(config.url.as_deref(), Some("http://collector.test/"));

        let stored = engine.get_locations().unwrap();
        assert_eq!(stored.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(stored.iter().all(|s| s.status == SyncStatus::Failed));
        assert_eq!(stored[1].location.latitude, fix(2).latitude);

        // Deleted ids are never reused
        engine.start().unwrap();
        engine.on_raw_fix(fix(10));
        wait_for_count(&engine, 3).await;
        assert_eq!(engine.get_locations().unwrap()[2].id, 4);
        shut(engine).await;
    }
}

#[tokio::test]
async fn test_headless_events_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    {
        let engine = open(path);
        engine.configure(&json!({ "stop_on_terminate": false })).unwrap();
        engine.start().unwrap();
        engine.on_host_signal(HostSignal::Terminated).await;
        assert!(engine.is_running());

        engine.on_raw_fix(fix(1));
        wait_for_count(&engine, 1).await;
        engine.flush_events().await;
        shut(engine).await;
    }

    {
        let engine = open(path);
        let received: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        engine.headless_task(Arc::new(move |name: &str, params: &Value| {
            sink.lock().push((name.to_string(), params.clone()));
        }));
        engine.flush_events().await;

        let received = received.lock().clone();
        let names: Vec<&str> = received.iter().map(|(name, _)| name.as_str()).collect();
        let location = names.iter().position(|name| *name == "location").unwrap();
        assert_eq!(received[location].1["id"], 1);
        assert_eq!(received[location].1["status"], "PENDING");
        let stop = names.iter().rposition(|name| *name == "stop").unwrap();
        assert!(location < stop);
        shut(engine).await;
    }
}

#[tokio::test]
async fn test_boot_start_delivers_headless_from_first_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    {
        let engine = open(path);
        engine
            .configure(&json!({ "stop_on_terminate": false, "start_on_boot": true }))
            .unwrap();
        shut(engine).await;
    }

    let engine = open(path);
    let received: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    engine.headless_task(Arc::new(move |name: &str, params: &Value| {
        sink.lock().push((name.to_string(), params.clone()));
    }));

    assert!(engine.on_boot().unwrap());
    engine.on_raw_fix(fix(1));
    wait_for_count(&engine, 1).await;
    engine.settle().await;

    let received = received.lock().clone();
    let names: Vec<&str> = received.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(&names[..2], &["start", "location"]);
    assert_eq!(received[1].1["id"], 1);
    shut(engine).await;
}

#[test]
fn test_logs_and_events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("direct.db");
    let path = path.to_str().unwrap();

    {
        let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::new(path).unwrap());
        let logs = LogStore::open(backend.clone()).unwrap();
        logs.append(10, LogLevel::Info, "first".into(), None).unwrap();
        logs.append(20, LogLevel::Error, "second".into(), Some("trace".into()))
            .unwrap();
        let events = EventLog::open(backend.clone()).unwrap();
        events.append("location", &json!({ "id": 7 })).unwrap();
        backend.flush().unwrap();
    }

    {
        let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::new(path).unwrap());
        let logs = LogStore::open(backend.clone()).unwrap();
        let entries = logs.entries(10, 0, LogLevel::Trace).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].stack_trace.as_deref(), Some("trace"));
        assert_eq!(logs.append(30, LogLevel::Info, "third".into(), None).unwrap(), 3);

        let events = EventLog::open(backend).unwrap();
        let pending = events.drain().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "location");
        assert!(events.is_empty().unwrap());
    }
}
