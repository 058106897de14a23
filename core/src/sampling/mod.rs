//! Sampling control
//!
//! Filters raw fixes into samples and derives the provider request from the
//! operating mode and motion state.

pub mod controller;
pub mod profile;

pub use controller::{mode_interval_ms, SamplingController, SamplingDecision};
pub use profile::{compute_profile, compute_request, ProviderRequest, SamplingProfile};
