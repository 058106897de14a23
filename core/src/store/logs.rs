// Log ring: bounded, append-only log of engine events
//
// Fed by the tracing layer in `crate::logging`. Nothing in here may log
// through `tracing` itself, or every write would recurse into the ring.

use crate::store::backend::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum retained log entries
pub const MAX_LOG_ENTRIES: usize = 10_000;

const LOG_PREFIX: &[u8] = b"log_";
const NEXT_LOG_ID_KEY: &[u8] = b"meta_next_log_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
    pub stack_trace: Option<String>,
}

fn entry_key(id: u64) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

struct RingCursor {
    next_id: u64,
    /// Lowest id that may still be stored
    oldest_id: u64,
    len: usize,
}

/// Persistent ring of log entries
pub struct LogStore {
    backend: Arc<dyn StorageBackend>,
    cursor: Mutex<RingCursor>,
    capacity: usize,
}

impl LogStore {
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self, String> {
        Self::with_capacity(backend, MAX_LOG_ENTRIES)
    }

    pub fn with_capacity(backend: Arc<dyn StorageBackend>, capacity: usize) -> Result<Self, String> {
        let next_id = match backend.get(NEXT_LOG_ID_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_be_bytes(raw)
            }
            _ => 1,
        };

        let stored = backend.scan_prefix(LOG_PREFIX)?;
        let oldest_id = stored
            .first()
            .map(|(key, _)| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&key[LOG_PREFIX.len()..]);
                u64::from_be_bytes(raw)
            })
            .unwrap_or(next_id);

        Ok(Self {
            backend,
            cursor: Mutex::new(RingCursor {
                next_id,
                oldest_id,
                len: stored.len(),
            }),
            capacity: capacity.max(1),
        })
    }

    /// Append an entry, evicting the oldest ones beyond capacity
    pub fn append(
        &self,
        timestamp: u64,
        level: LogLevel,
        message: String,
        stack_trace: Option<String>,
    ) -> Result<u64, String> {
        let mut cursor = self.cursor.lock();
        let id = cursor.next_id;
        let entry = LogEntry {
            id,
            timestamp,
            level,
            message,
            stack_trace,
        };
        let bytes = bincode::serialize(&entry).map_err(|e| e.to_string())?;
        self.backend.put(NEXT_LOG_ID_KEY, &(id + 1).to_be_bytes())?;
        self.backend.put(&entry_key(id), &bytes)?;
        cursor.next_id = id + 1;
        cursor.len += 1;

        // Ids may have gaps if a previous process died mid-append
        while cursor.len > self.capacity && cursor.oldest_id < id {
            let key = entry_key(cursor.oldest_id);
            if self.backend.get(&key)?.is_some() {
                self.backend.remove(&key)?;
                cursor.len -= 1;
            }
            cursor.oldest_id += 1;
        }
        Ok(id)
    }

    /// Entries with id greater than `from_id` and level at least `min_level`,
    /// ascending, at most `limit`
    pub fn entries(&self, limit: usize, from_id: u64, min_level: LogLevel) -> Result<Vec<LogEntry>, String> {
        let _cursor = self.cursor.lock();
        let mut out = Vec::new();
        for (_, value) in self.backend.scan_prefix(LOG_PREFIX)? {
            if out.len() >= limit {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&value).map_err(|e| e.to_string())?;
            if entry.id > from_id && entry.level >= min_level {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize, String> {
        Ok(self.cursor.lock().len)
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }

    pub fn flush(&self) -> Result<(), String> {
        self.backend.flush()
    }
}
