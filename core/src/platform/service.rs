//! Host-facing service types
//!
//! The positioning hardware, the permission UI and the host lifecycle live
//! outside this crate. They reach the engine through the narrow interfaces
//! defined here: platform code implements [`FixSource`] and pushes fixes and
//! provider changes into the engine; the engine reports its state back as a
//! [`ServiceStatus`].

use crate::location::Location;
use crate::sampling::ProviderRequest;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

// ============================================================================
// ENUMS & TYPES
// ============================================================================

/// Lifecycle of the tracking pipeline. `start` is refused while a stop is
/// still draining the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Stopped,
    Running,
    Stopping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Location permission state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    NotAuthorized,
    Authorized,
    /// Only while the app is in the foreground
    AuthorizedForeground,
}

impl AuthorizationStatus {
    /// Numeric value used by host bindings
    pub fn as_id(&self) -> u8 {
        match self {
            Self::NotAuthorized => 0,
            Self::Authorized => 1,
            Self::AuthorizedForeground => 2,
        }
    }

    pub fn is_authorized(&self) -> bool {
        !matches!(self, Self::NotAuthorized)
    }
}

/// Derived view of the service, computed on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub is_running: bool,
    pub pipeline: PipelineState,
    pub location_services_enabled: bool,
    pub authorization: AuthorizationStatus,
}

/// Asynchronous provider state changes pushed by platform code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProviderEvent {
    /// Location services switched on or off
    ServicesEnabled(bool),
    /// Permission changed
    Authorization(AuthorizationStatus),
    /// Provider malfunction
    Error(String),
}

/// Options for a one-shot location request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOptions {
    /// How long to wait for a fix
    pub timeout_ms: u64,
    /// Accept a cached fix up to this age
    pub maximum_age_ms: Option<u64>,
    pub enable_high_accuracy: bool,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: u64::from(u32::MAX),
            maximum_age_ms: None,
            enable_high_accuracy: false,
        }
    }
}

// ============================================================================
// FIX SOURCE
// ============================================================================

/// The raw positioning provider, implemented by platform code.
///
/// Fixes are not pulled: the platform pushes them with
/// `BackgroundGeolocation::on_raw_fix` at whatever cadence the provider
/// delivers after [`FixSource::request_updates`].
pub trait FixSource: Send + Sync {
    /// Start or re-tune continuous updates
    fn request_updates(&self, request: &ProviderRequest) -> Result<(), String>;
    fn stop_updates(&self);
    /// Ask for a single fix (one-shot location request)
    fn request_single_update(&self, high_accuracy: bool) -> Result<(), String>;
    fn location_services_enabled(&self) -> bool;
    fn authorization(&self) -> AuthorizationStatus;
    fn last_known_location(&self) -> Option<Location>;
}

// ============================================================================
// TASK LEASES
// ============================================================================

/// Opaque background-execution leases handed to the host
#[derive(Debug, Default)]
pub struct TaskLeases {
    state: Mutex<LeaseState>,
}

#[derive(Debug, Default)]
struct LeaseState {
    next_key: u64,
    active: HashSet<u64>,
}

impl TaskLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a lease and return its key
    pub fn start(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        state.active.insert(key);
        key
    }

    /// Close a lease. Returns false for unknown keys.
    pub fn end(&self, key: u64) -> bool {
        let removed = self.state.lock().active.remove(&key);
        if !removed {
            warn!("endTask called with unknown task key {}", key);
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}
