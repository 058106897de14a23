// Store module: sample queue, log ring and pending event persistence

pub mod backend;
pub mod events;
pub mod locations;
pub mod logs;

pub use backend::{open_persistent, MemoryStorage, SledStorage, StorageBackend};
pub use events::{EventLog, PendingEvent};
pub use locations::{LocationFilter, LocationStore, StoreError};
pub use logs::{LogEntry, LogLevel, LogStore};
