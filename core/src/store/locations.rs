// Location store: bounded, ordered queue of accepted samples
//
// Samples are kept under `loc_` + big-endian id so a prefix scan yields them
// oldest-first. Every operation runs under one lock, which makes
// append+evict, list and delete atomic with respect to each other.

use crate::location::{Location, LocationSample, SyncStatus};
use crate::store::backend::StorageBackend;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const SAMPLE_PREFIX: &[u8] = b"loc_";
const NEXT_ID_KEY: &[u8] = b"meta_next_location_id";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Selection for [`LocationStore::list_all`]
#[derive(Debug, Clone, Default)]
pub struct LocationFilter {
    /// Only samples with this status
    pub status: Option<SyncStatus>,
    /// Only samples captured at or after this time (ms)
    pub since: Option<u64>,
    /// At most this many samples (oldest first)
    pub limit: Option<usize>,
}

impl LocationFilter {
    fn matches(&self, sample: &LocationSample) -> bool {
        self.status.map_or(true, |s| sample.status == s)
            && self.since.map_or(true, |t| sample.location.time >= t)
    }
}

struct StoreState {
    next_id: u64,
    total: usize,
    unsynced: usize,
}

impl StoreState {
    fn forget(&mut self, status: SyncStatus) {
        self.total = self.total.saturating_sub(1);
        if status.is_unsynced() {
            self.unsynced = self.unsynced.saturating_sub(1);
        }
    }
}

/// Durable location queue
pub struct LocationStore {
    backend: Arc<dyn StorageBackend>,
    state: Mutex<StoreState>,
}

fn sample_key(id: u64) -> Vec<u8> {
    let mut key = SAMPLE_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

impl LocationStore {
    /// Open the store on `backend`, resuming the persisted id counter
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self, StoreError> {
        let stored = backend.get(NEXT_ID_KEY).map_err(StoreError::StorageError)?;
        let mut next_id = match stored {
            Some(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_be_bytes(raw)
            }
            _ => 1,
        };

        let entries = backend
            .scan_prefix(SAMPLE_PREFIX)
            .map_err(StoreError::StorageError)?;

        // The counter may lag behind if the process died between the two writes
        if let Some((key, _)) = entries.last() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&key[SAMPLE_PREFIX.len()..]);
            next_id = next_id.max(u64::from_be_bytes(raw) + 1);
        }

        let mut unsynced = 0;
        for (_, value) in &entries {
            let sample: LocationSample = bincode::deserialize(value)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            if sample.status.is_unsynced() {
                unsynced += 1;
            }
        }

        Ok(Self {
            backend,
            state: Mutex::new(StoreState {
                next_id,
                total: entries.len(),
                unsynced,
            }),
        })
    }

    fn read_one(&self, id: u64) -> Result<Option<LocationSample>, StoreError> {
        self.backend
            .get(&sample_key(id))
            .map_err(StoreError::StorageError)?
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))
            })
            .transpose()
    }

    fn read_all(&self) -> Result<Vec<LocationSample>, StoreError> {
        self.backend
            .scan_prefix(SAMPLE_PREFIX)
            .map_err(StoreError::StorageError)?
            .into_iter()
            .map(|(_, value)| {
                bincode::deserialize::<LocationSample>(&value)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))
            })
            .collect()
    }

    fn write(&self, sample: &LocationSample) -> Result<(), StoreError> {
        let bytes = bincode::serialize(sample)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.backend
            .put(&sample_key(sample.id), &bytes)
            .map_err(StoreError::StorageError)
    }

    /// Persist an accepted location and enforce the retention cap.
    ///
    /// When the store holds more than `max_locations` samples afterwards, the
    /// oldest SYNCED samples are evicted first, then the oldest of any status.
    pub fn append(&self, location: Location, max_locations: u32) -> Result<u64, StoreError> {
        let mut state = self.state.lock();

        let id = state.next_id;
        self.backend
            .put(NEXT_ID_KEY, &(id + 1).to_be_bytes())
            .map_err(StoreError::StorageError)?;
        state.next_id = id + 1;

        self.write(&LocationSample {
            id,
            location,
            status: SyncStatus::Pending,
        })?;
        state.total += 1;
        state.unsynced += 1;

        let cap = max_locations.max(1) as usize;
        if state.total > cap {
            let excess = state.total - cap;
            self.evict(&mut state, excess)?;
        }

        self.backend.flush().map_err(StoreError::StorageError)?;
        Ok(id)
    }

    fn evict(&self, state: &mut StoreState, excess: usize) -> Result<(), StoreError> {
        let all = self.read_all()?;
        let mut victims: Vec<&LocationSample> = all
            .iter()
            .filter(|s| s.status == SyncStatus::Synced)
            .take(excess)
            .collect();

        if victims.len() < excess {
            let missing = excess - victims.len();
            victims.extend(
                all.iter()
                    .filter(|s| s.status != SyncStatus::Synced)
                    .take(missing),
            );
        }

        for victim in &victims {
            self.backend
                .remove(&sample_key(victim.id))
                .map_err(StoreError::StorageError)?;
            state.forget(victim.status);
        }
        let victims: Vec<u64> = victims.iter().map(|s| s.id).collect();
        debug!("Retention evicted {} sample(s): {:?}", victims.len(), victims);
        Ok(())
    }

    /// Samples matching `filter`, ascending by id
    pub fn list_all(&self, filter: &LocationFilter) -> Result<Vec<LocationSample>, StoreError> {
        let _state = self.state.lock();
        let iter = self.read_all()?.into_iter().filter(|s| filter.matches(s));
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    /// PENDING and FAILED samples, oldest first
    pub fn list_pending(&self) -> Result<Vec<LocationSample>, StoreError> {
        let _state = self.state.lock();
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|s| s.status.is_unsynced())
            .collect())
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().unsynced)
    }

    pub fn get(&self, id: u64) -> Result<Option<LocationSample>, StoreError> {
        let _state = self.state.lock();
        self.read_one(id)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().total)
    }

    // Apply `to` to every listed sample whose status is in `from`.
    // Missing ids (deleted or evicted meanwhile) are skipped.
    fn transition(&self, ids: &[u64], from: &[SyncStatus], to: SyncStatus) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut changed = 0;
        for id in ids {
            let Some(mut sample) = self.read_one(*id)? else {
                continue;
            };
            if from.contains(&sample.status) {
                let was_unsynced = sample.status.is_unsynced();
                sample.status = to;
                self.write(&sample)?;
                match (was_unsynced, to.is_unsynced()) {
                    (true, false) => state.unsynced = state.unsynced.saturating_sub(1),
                    (false, true) => state.unsynced += 1,
                    _ => {}
                }
                changed += 1;
            }
        }
        self.backend.flush().map_err(StoreError::StorageError)?;
        Ok(changed)
    }

    /// PENDING to SYNCED. A FAILED sample is retried through PENDING first.
    pub fn mark_synced(&self, ids: &[u64]) -> Result<usize, StoreError> {
        self.transition(ids, &[SyncStatus::Pending], SyncStatus::Synced)
    }

    /// PENDING to FAILED. SYNCED samples are never downgraded.
    pub fn mark_failed(&self, ids: &[u64]) -> Result<usize, StoreError> {
        self.transition(ids, &[SyncStatus::Pending], SyncStatus::Failed)
    }

    /// FAILED to PENDING, taken when a failed sample is retried
    pub fn mark_pending(&self, ids: &[u64]) -> Result<usize, StoreError> {
        self.transition(ids, &[SyncStatus::Failed], SyncStatus::Pending)
    }

    /// Delete one sample. Returns false if it did not exist.
    pub fn delete(&self, id: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(sample) = self.read_one(id)? else {
            return Ok(false);
        };
        self.backend
            .remove(&sample_key(id))
            .map_err(StoreError::StorageError)?;
        self.backend.flush().map_err(StoreError::StorageError)?;
        state.forget(sample.status);
        Ok(true)
    }

    /// Delete every sample. The id counter keeps running.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let keys: Vec<Vec<u8>> = self
            .backend
            .scan_prefix(SAMPLE_PREFIX)
            .map_err(StoreError::StorageError)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.backend.remove(key).map_err(StoreError::StorageError)?;
        }
        self.backend.flush().map_err(StoreError::StorageError)?;
        state.total = 0;
        state.unsynced = 0;
        Ok(keys.len())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush().map_err(StoreError::StorageError)
    }
}
