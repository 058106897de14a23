//! Platform integration layer
//!
//! This module provides:
//! - The mode arbiter switching between foreground and background profiles
//! - Host lifecycle signals and provider events
//! - The fix source interface implemented by platform code
//! - Service status and background task leases

pub mod mode;
pub mod service;

pub use mode::{HostSignal, ModeArbiter, OperatingMode};
pub use service::{
    AuthorizationStatus, FixSource, PipelineState, PositionOptions, ProviderEvent, ServiceStatus,
    TaskLeases,
};
