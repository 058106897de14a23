//! Motion state classification
//!
//! Turns the raw fix stream (plus optional activity hints) into a
//! MOVING / STATIONARY state and the current stationary region.
//!
//! Rules:
//! 1. The first usable fix anchors a stationary region.
//! 2. While STATIONARY, a fix strictly farther than `stationary_radius` from
//!    the anchor starts movement.
//! 3. While MOVING, silence for `stationary_timeout_ms` or a confident STILL
//!    observation re-anchors at the most recent fix.
//! 4. A zero radius, or a fix whose accuracy is worse than the radius, is
//!    never trusted for a stationary lock: the device is treated as MOVING.

use super::activity::ActivityObservation;
use crate::config::Config;
use crate::location::{Location, StationaryRegion};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    /// No usable fix seen yet
    Unknown,
    Moving,
    Stationary,
}

impl std::fmt::Display for MotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MotionState::Unknown => write!(f, "UNKNOWN"),
            MotionState::Moving => write!(f, "MOVING"),
            MotionState::Stationary => write!(f, "STATIONARY"),
        }
    }
}

/// State change signalled to the rest of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum MotionTransition {
    /// Device left its stationary region
    StartMoving,
    /// Device is (re-)confirmed stationary in this region
    Stationary(StationaryRegion),
}

#[derive(Debug, Clone)]
pub struct MotionClassifier {
    state: MotionState,
    region: Option<StationaryRegion>,
    previous_region: Option<StationaryRegion>,
    last_fix: Option<Location>,
    /// Receipt time of `last_fix` (ms)
    last_fix_at: Option<u64>,
}

fn is_untrusted(fix: &Location, radius: f64) -> bool {
    radius <= 0.0 || fix.accuracy.map_or(false, |accuracy| accuracy > radius)
}

impl MotionClassifier {
    pub fn new() -> Self {
        Self {
            state: MotionState::Unknown,
            region: None,
            previous_region: None,
            last_fix: None,
            last_fix_at: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Current stationary region, only while STATIONARY
    pub fn stationary_region(&self) -> Option<&StationaryRegion> {
        self.region.as_ref()
    }

    /// The region left most recently
    pub fn previous_region(&self) -> Option<&StationaryRegion> {
        self.previous_region.as_ref()
    }

    pub fn is_moving(&self) -> bool {
        self.state == MotionState::Moving
    }

    /// Classify a raw fix received at `now_ms`
    pub fn on_fix(&mut self, fix: &Location, now_ms: u64, config: &Config) -> Option<MotionTransition> {
        self.last_fix = Some(fix.clone());
        self.last_fix_at = Some(now_ms);

        let radius = config.stationary_radius;
        if is_untrusted(fix, radius) {
            return self.enter_moving();
        }

        match self.state {
            MotionState::Unknown => Some(self.enter_stationary(fix.clone(), radius)),
            MotionState::Stationary => {
                let exited = self
                    .region
                    .as_ref()
                    .map_or(true, |region| region.is_exited_by(fix));
                if exited {
                    self.enter_moving()
                } else {
                    None
                }
            }
            MotionState::Moving => None,
        }
    }

    /// Periodic check for the quiescence window
    pub fn on_tick(&mut self, now_ms: u64, config: &Config) -> Option<MotionTransition> {
        if self.state != MotionState::Moving {
            return None;
        }
        let last_at = self.last_fix_at?;
        if now_ms.saturating_sub(last_at) < config.stationary_timeout_ms {
            return None;
        }
        debug!(
            "No fix for {} ms while moving, confirming stationary",
            now_ms.saturating_sub(last_at)
        );
        self.anchor_at_last_fix(config)
    }

    /// Feed an activity hint. It can only shorten the way to STATIONARY.
    pub fn on_activity(&mut self, observation: &ActivityObservation, config: &Config) -> Option<MotionTransition> {
        if self.state != MotionState::Moving || !config.stop_on_still_activity {
            return None;
        }
        if !observation.is_confident_still(config.still_confidence) {
            return None;
        }
        debug!("STILL activity ({}%) confirms stationary", observation.confidence);
        self.anchor_at_last_fix(config)
    }

    fn anchor_at_last_fix(&mut self, config: &Config) -> Option<MotionTransition> {
        let radius = config.stationary_radius;
        let anchor = self.last_fix.clone()?;
        if is_untrusted(&anchor, radius) {
            return None;
        }
        Some(self.enter_stationary(anchor, radius))
    }

    fn enter_moving(&mut self) -> Option<MotionTransition> {
        match self.state {
            MotionState::Moving => None,
            MotionState::Unknown => {
                self.state = MotionState::Moving;
                None
            }
            MotionState::Stationary => {
                self.state = MotionState::Moving;
                if let Some(region) = self.region.take() {
                    self.previous_region = Some(region);
                }
                Some(MotionTransition::StartMoving)
            }
        }
    }

    fn enter_stationary(&mut self, anchor: Location, radius: f64) -> MotionTransition {
        let region = StationaryRegion { anchor, radius };
        if let Some(old) = self.region.replace(region.clone()) {
            self.previous_region = Some(old);
        }
        self.state = MotionState::Stationary;
        MotionTransition::Stationary(region)
    }
}

impl Default for MotionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::geo::offset_north;
    use crate::motion::activity::ActivityType;

    const LAT: f64 = 47.0;
    const LON: f64 = 8.0;

    fn fix_at(meters_north: f64, time: u64) -> Location {
        Location::new("gps", time, offset_north(LAT, meters_north), LON).with_accuracy(5.0)
    }

    fn config() -> Config {
        Config {
            stationary_radius: 50.0,
            stationary_timeout_ms: 60_000,
            ..Config::default()
        }
    }

    fn anchored(config: &Config) -> MotionClassifier {
        let mut classifier = MotionClassifier::new();
        let first = classifier.on_fix(&fix_at(0.0, 0), 0, config);
        assert!(matches!(first, Some(MotionTransition::Stationary(_))));
        classifier
    }

    #[test]
    fn test_first_fix_anchors_region() {
        let config = config();
        let classifier = anchored(&config);
        assert_eq!(classifier.state(), MotionState::Stationary);
        let region = classifier.stationary_region().unwrap();
        assert_eq!(region.radius, 50.0);
    }

    #[test]
    fn test_within_radius_stays_stationary() {
        let config = config();
        let mut classifier = anchored(&config);
        for (i, meters) in [10.0, 30.0, 49.9].iter().enumerate() {
            assert_eq!(classifier.on_fix(&fix_at(*meters, i as u64), i as u64, &config), None);
        }
        assert_eq!(classifier.state(), MotionState::Stationary);
    }

    #[test]
    fn test_beyond_radius_starts_moving() {
        let config = config();
        let mut classifier = anchored(&config);
        let transition = classifier.on_fix(&fix_at(50.1, 1), 1, &config);
        assert_eq!(transition, Some(MotionTransition::StartMoving));
        assert!(classifier.is_moving());
        assert!(classifier.stationary_region().is_none());
        assert!(classifier.previous_region().is_some());

        // Further fixes while moving emit nothing
        assert_eq!(classifier.on_fix(&fix_at(200.0, 2), 2, &config), None);
    }

    #[test]
    fn test_quiescence_reanchors_at_last_fix() {
        let config = config();
        let mut classifier = anchored(&config);
        classifier.on_fix(&fix_at(100.0, 1_000), 1_000, &config);
        classifier.on_fix(&fix_at(300.0, 2_000), 2_000, &config);

        assert_eq!(classifier.on_tick(30_000, &config), None);
        match classifier.on_tick(62_000, &config) {
            Some(MotionTransition::Stationary(region)) => {
                assert_eq!(region.anchor.time, 2_000);
            }
            other => panic!("expected stationary, got {:?}", other),
        }
        assert_eq!(classifier.on_tick(200_000, &config), None);
    }

    #[test]
    fn test_confident_still_activity_reanchors() {
        let config = config();
        let mut classifier = anchored(&config);
        classifier.on_fix(&fix_at(100.0, 1), 1, &config);

        let weak = ActivityObservation::new(ActivityType::Still, 40);
        assert_eq!(classifier.on_activity(&weak, &config), None);

        let walking = ActivityObservation::new(ActivityType::Walking, 100);
        assert_eq!(classifier.on_activity(&walking, &config), None);

        let still = ActivityObservation::new(ActivityType::Still, 90);
        assert!(matches!(
            classifier.on_activity(&still, &config),
            Some(MotionTransition::Stationary(_))
        ));
    }

    #[test]
    fn test_still_ignored_when_disabled() {
        let config = Config {
            stop_on_still_activity: false,
            ..config()
        };
        let mut classifier = anchored(&config);
        classifier.on_fix(&fix_at(100.0, 1), 1, &config);
        let still = ActivityObservation::new(ActivityType::Still, 100);
        assert_eq!(classifier.on_activity(&still, &config), None);
    }

    #[test]
    fn test_zero_radius_never_locks_stationary() {
        let config = Config {
            stationary_radius: 0.0,
            ..config()
        };
        let mut classifier = MotionClassifier::new();
        assert_eq!(classifier.on_fix(&fix_at(0.0, 0), 0, &config), None);
        assert_eq!(classifier.state(), MotionState::Moving);
        assert_eq!(classifier.on_tick(1_000_000, &config), None);
        let still = ActivityObservation::new(ActivityType::Still, 100);
        assert_eq!(classifier.on_activity(&still, &config), None);
        assert_eq!(classifier.state(), MotionState::Moving);
    }

    #[test]
    fn test_poor_accuracy_treated_as_moving() {
        let config = config();
        let mut classifier = anchored(&config);
        let noisy = fix_at(5.0, 1).with_accuracy(400.0);
        assert_eq!(
            classifier.on_fix(&noisy, 1, &config),
            Some(MotionTransition::StartMoving)
        );
        // Quiescence cannot anchor on the noisy fix
        assert_eq!(classifier.on_tick(1_000_000, &config), None);
    }
}
