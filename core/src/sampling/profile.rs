//! Provider request profiles
//!
//! Maps {operating mode, motion state} onto the interval and accuracy the fix
//! source should be asked for. Stateless and deterministic: the same inputs
//! always produce the same request.

use crate::config::{Accuracy, Config};
use crate::motion::MotionState;
use crate::platform::OperatingMode;
use serde::{Deserialize, Serialize};

/// Sampling profile picked for the current conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingProfile {
    /// Foreground and moving: fastest interval
    Tracking,
    /// Foreground and stationary
    ForegroundIdle,
    /// Background and moving
    BackgroundTracking,
    /// Background and stationary: slowest, coarser accuracy
    BackgroundIdle,
}

impl std::fmt::Display for SamplingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tracking => write!(f, "Tracking"),
            Self::ForegroundIdle => write!(f, "ForegroundIdle"),
            Self::BackgroundTracking => write!(f, "BackgroundTracking"),
            Self::BackgroundIdle => write!(f, "BackgroundIdle"),
        }
    }
}

/// What the fix source is asked to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Desired update interval in milliseconds
    pub interval_ms: u64,
    /// Fastest rate the pipeline can take updates at
    pub fastest_interval_ms: u64,
    pub accuracy: Accuracy,
    /// Activity recognition cadence
    pub activities_interval_ms: u64,
}

/// Pick the profile for a mode/motion combination
pub fn compute_profile(mode: OperatingMode, motion: MotionState) -> SamplingProfile {
    match (mode, motion) {
        (OperatingMode::Foreground, MotionState::Stationary) => SamplingProfile::ForegroundIdle,
        (OperatingMode::Foreground, _) => SamplingProfile::Tracking,
        (OperatingMode::Background, MotionState::Stationary) => SamplingProfile::BackgroundIdle,
        (OperatingMode::Background, _) => SamplingProfile::BackgroundTracking,
    }
}

/// Concrete provider request for a profile
pub fn compute_request(profile: SamplingProfile, config: &Config) -> ProviderRequest {
    let desired = config.accuracy();
    let (interval_ms, accuracy) = match profile {
        SamplingProfile::Tracking => (config.fastest_interval_ms, desired),
        SamplingProfile::ForegroundIdle => (config.interval_ms, desired),
        SamplingProfile::BackgroundTracking => (config.interval_ms, desired),
        SamplingProfile::BackgroundIdle => (config.interval_ms.saturating_mul(2), desired.coarser()),
    };

    let background = matches!(
        profile,
        SamplingProfile::BackgroundTracking | SamplingProfile::BackgroundIdle
    );
    let accuracy = if background && config.save_battery_on_background {
        Accuracy::Passive
    } else {
        accuracy
    };

    ProviderRequest {
        interval_ms,
        fastest_interval_ms: config.fastest_interval_ms.min(interval_ms),
        accuracy,
        activities_interval_ms: config.activities_interval_ms,
    }
}
