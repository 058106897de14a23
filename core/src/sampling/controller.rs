// Sampling controller: decides which raw fixes become samples
//
// A fix is dropped only when it is both too close to the last accepted
// sample (below `distance_filter`) and too soon after it (below the interval
// of the current mode). Either enough distance or enough time accepts it.

use super::profile::{compute_profile, compute_request, ProviderRequest};
use crate::config::Config;
use crate::location::Location;
use crate::motion::MotionState;
use crate::platform::OperatingMode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingDecision {
    Accept,
    /// Too close in both space and time to the last accepted sample
    Drop { distance_m: f64, elapsed_ms: u64 },
}

impl SamplingDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, SamplingDecision::Accept)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SamplingController {
    last_accepted: Option<Location>,
}

/// Interval implied by the operating mode
pub fn mode_interval_ms(mode: OperatingMode, config: &Config) -> u64 {
    match mode {
        OperatingMode::Foreground => config.fastest_interval_ms,
        OperatingMode::Background => config.interval_ms,
    }
}

impl SamplingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_accepted(&self) -> Option<&Location> {
        self.last_accepted.as_ref()
    }

    /// Filter a raw fix. Accepted fixes become the new reference point.
    pub fn on_raw_fix(&mut self, fix: &Location, mode: OperatingMode, config: &Config) -> SamplingDecision {
        if let Some(last) = &self.last_accepted {
            let distance_m = last.distance_to(fix);
            let elapsed_ms = fix.time.saturating_sub(last.time);
            if distance_m < config.distance_filter && elapsed_ms < mode_interval_ms(mode, config) {
                return SamplingDecision::Drop {
                    distance_m,
                    elapsed_ms,
                };
            }
        }
        self.last_accepted = Some(fix.clone());
        SamplingDecision::Accept
    }

    /// Provider request for the current mode and motion state
    pub fn desired_request(&self, mode: OperatingMode, motion: MotionState, config: &Config) -> ProviderRequest {
        compute_request(compute_profile(mode, motion), config)
    }

    /// Location to persist for an accepted fix
    pub fn sample_from_fix(fix: &Location, config: &Config) -> Location {
        let mut location = fix.clone();
        location.location_provider = config.location_provider;
        location
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::geo::offset_north;
    use crate::location::LocationProviderKind;

    fn fix(meters_north: f64, time: u64) -> Location {
        Location::new("gps", time, offset_north(40.0, meters_north), -3.7)
    }

    #[test]
    fn test_distance_filter_scenario() {
        let config = Config {
            distance_filter: 50.0,
            ..Config::default()
        };
        let mut controller = SamplingController::new();
        let mode = OperatingMode::Background;

        let accepted: Vec<f64> = [0.0, 10.0, 60.0]
            .iter()
            .enumerate()
            .filter(|(i, m)| controller.on_raw_fix(&fix(**m, 1_000 + *i as u64), mode, &config).is_accept())
            .map(|(_, m)| *m)
            .collect();

        assert_eq!(accepted, vec![0.0, 60.0]);
    }

    #[test]
    fn test_elapsed_interval_accepts_close_fix() {
        let config = Config {
            distance_filter: 50.0,
            interval_ms: 10_000,
            fastest_interval_ms: 1_000,
            ..Config::default()
        };
        let mut controller = SamplingController::new();
        assert!(controller.on_raw_fix(&fix(0.0, 0), OperatingMode::Background, &config).is_accept());

        // 5 s later and 1 m away: too soon for background ...
        assert!(!controller.on_raw_fix(&fix(1.0, 5_000), OperatingMode::Background, &config).is_accept());
        // ... but long enough for foreground
        assert!(controller.on_raw_fix(&fix(1.0, 5_000), OperatingMode::Foreground, &config).is_accept());
    }

    #[test]
    fn test_drop_reports_distance() {
        let config = Config::default();
        let mut controller = SamplingController::new();
        controller.on_raw_fix(&fix(0.0, 0), OperatingMode::Foreground, &config);
        match controller.on_raw_fix(&fix(20.0, 10), OperatingMode::Foreground, &config) {
            SamplingDecision::Drop { distance_m, elapsed_ms } => {
                assert!((distance_m - 20.0).abs() < 1e-6);
                assert_eq!(elapsed_ms, 10);
            }
            SamplingDecision::Accept => panic!("fix should have been dropped"),
        }
        // Reference point is still the first fix
        assert_eq!(controller.last_accepted().unwrap().time, 0);
    }

    #[test]
    fn test_sample_carries_configured_provider() {
        let config = Config {
            location_provider: LocationProviderKind::Activity,
            ..Config::default()
        };
        let sample = SamplingController::sample_from_fix(&fix(0.0, 0), &config);
        assert_eq!(sample.location_provider, LocationProviderKind::Activity);
    }
}
