//! Motion detection
//!
//! Classifies the device as moving or stationary from fixes and activity
//! recognition hints.

pub mod activity;
pub mod classifier;

pub use activity::{ActivityObservation, ActivityType};
pub use classifier::{MotionClassifier, MotionState, MotionTransition};
