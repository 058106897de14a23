// Pending event log: events emitted while no handler could receive them
//
// The headless path appends here when the host is gone and no headless
// handler has been registered yet. A handler registered later (possibly in a
// fresh process) drains and replays the log.

use crate::store::backend::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum retained pending events
pub const MAX_PENDING_EVENTS: usize = 1_000;

const EVENT_PREFIX: &[u8] = b"evt_";
const NEXT_EVENT_ID_KEY: &[u8] = b"meta_next_event_id";

/// A stored event: name plus plain JSON parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: u64,
    pub name: String,
    /// JSON text of the event parameters
    pub params: String,
}

fn event_key(id: u64) -> Vec<u8> {
    let mut key = EVENT_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub struct EventLog {
    backend: Arc<dyn StorageBackend>,
    next_id: Mutex<u64>,
}

impl EventLog {
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self, String> {
        let mut next_id = match backend.get(NEXT_EVENT_ID_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_be_bytes(raw)
            }
            _ => 1,
        };
        if let Some((key, _)) = backend.scan_prefix(EVENT_PREFIX)?.last() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&key[EVENT_PREFIX.len()..]);
            next_id = next_id.max(u64::from_be_bytes(raw) + 1);
        }
        Ok(Self {
            backend,
            next_id: Mutex::new(next_id),
        })
    }

    pub fn append(&self, name: &str, params: &serde_json::Value) -> Result<u64, String> {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        let event = PendingEvent {
            id,
            name: name.to_string(),
            params: params.to_string(),
        };
        let bytes = serde_json::to_vec(&event).map_err(|e| e.to_string())?;
        self.backend.put(NEXT_EVENT_ID_KEY, &(id + 1).to_be_bytes())?;
        self.backend.put(&event_key(id), &bytes)?;
        *next_id = id + 1;

        let count = self.backend.count_prefix(EVENT_PREFIX)?;
        if count > MAX_PENDING_EVENTS {
            for (key, _) in self
                .backend
                .scan_prefix(EVENT_PREFIX)?
                .into_iter()
                .take(count - MAX_PENDING_EVENTS)
            {
                self.backend.remove(&key)?;
            }
        }
        self.backend.flush()?;
        Ok(id)
    }

    /// Remove and return every pending event, oldest first
    pub fn drain(&self) -> Result<Vec<PendingEvent>, String> {
        let _guard = self.next_id.lock();
        let mut events = Vec::new();
        for (key, value) in self.backend.scan_prefix(EVENT_PREFIX)? {
            if let Ok(event) = serde_json::from_slice::<PendingEvent>(&value) {
                events.push(event);
            }
            self.backend.remove(&key)?;
        }
        self.backend.flush()?;
        Ok(events)
    }

    pub fn len(&self) -> Result<usize, String> {
        self.backend.count_prefix(EVENT_PREFIX)
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;
    use serde_json::json;

    #[test]
    fn test_append_and_drain_in_order() {
        let log = EventLog::open(Arc::new(MemoryStorage::new())).unwrap();
        log.append("location", &json!({ "id": 1 })).unwrap();
        log.append("stationary", &json!({ "radius": 50.0 })).unwrap();
        assert_eq!(log.len().unwrap(), 2);

        let drained = log.drain().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name, "location");
        assert_eq!(drained[1].name, "stationary");
        let params: serde_json::Value = serde_json::from_str(&drained[0].params).unwrap();
        assert_eq!(params["id"], 1);

        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_ids_resume_after_reopen() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        {
            let log = EventLog::open(backend.clone()).unwrap();
            log.append("start", &serde_json::Value::Null).unwrap();
        }
        let log = EventLog::open(backend).unwrap();
        assert_eq!(log.append("stop", &serde_json::Value::Null).unwrap(), 2);
    }
}
