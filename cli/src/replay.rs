// Scripted host for the `run` command
//
// A replay script is JSON Lines. Each line is one platform input:
//
//   {"fix": {"latitude": 52.52, "longitude": 13.40, "accuracy": 8.0}}
//   {"activity": {"type": "STILL", "confidence": 90}}
//   {"signal": "Backgrounded"}
//   {"services": false}
//   {"authorization": 0}
//
// Blank lines and lines starting with '#' are skipped.

use anyhow::{Context, Result};
use geotrack_core::{
    ActivityObservation, AuthorizationStatus, FixSource, HostSignal, Location, ProviderRequest,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayFix {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Fix time in ms, defaults to the replay clock
    pub time: Option<u64>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub altitude: Option<f64>,
    pub bearing: Option<f64>,
}

fn default_provider() -> String {
    "gps".to_string()
}

impl ReplayFix {
    pub fn into_location(self, now_ms: u64) -> Location {
        let mut location = Location::new(&self.provider, self.time.unwrap_or(now_ms), self.latitude, self.longitude);
        location.accuracy = self.accuracy;
        location.speed = self.speed;
        location.altitude = self.altitude;
        location.bearing = self.bearing;
        location
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayLine {
    Fix(ReplayFix),
    Activity(ActivityObservation),
    Signal(HostSignal),
    Services(bool),
    Authorization(u8),
}

/// Parse a whole script, reporting the first bad line by number
pub fn parse_script(contents: &str) -> Result<Vec<ReplayLine>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line.trim())
                .with_context(|| format!("Invalid replay line {}", index + 1))
        })
        .collect()
}

pub fn read_script(path: &Path) -> Result<Vec<ReplayLine>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_script(&contents)
}

pub fn authorization_from_id(id: u8) -> Result<AuthorizationStatus> {
    match id {
        0 => Ok(AuthorizationStatus::NotAuthorized),
        1 => Ok(AuthorizationStatus::Authorized),
        2 => Ok(AuthorizationStatus::AuthorizedForeground),
        other => anyhow::bail!("Unknown authorization id: {}", other),
    }
}

/// Fix source driven by the script. Requests are only recorded.
pub struct ReplaySource {
    enabled: AtomicBool,
    authorization: Mutex<AuthorizationStatus>,
    current: Mutex<Option<ProviderRequest>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            authorization: Mutex::new(AuthorizationStatus::Authorized),
            current: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_authorization(&self, status: AuthorizationStatus) {
        *self.authorization.lock() = status;
    }

    /// Request currently in force, None while updates are stopped
    pub fn current_request(&self) -> Option<ProviderRequest> {
        *self.current.lock()
    }

    pub fn request_history(&self) -> Vec<ProviderRequest> {
        self.requests.lock().clone()
    }
}

impl Default for ReplaySource {
    fn default() -> Self {
        Self::new()
    }
}

impl FixSource for ReplaySource {
    fn request_updates(&self, request: &ProviderRequest) -> Result<(), String> {
        if !self.location_services_enabled() {
            return Err("location services are disabled".to_string());
        }
        tracing::debug!("Provider request {:?}", request);
        *self.current.lock() = Some(*request);
        self.requests.lock().push(*request);
        Ok(())
    }

    fn stop_updates(&self) {
        *self.current.lock() = None;
    }

    fn request_single_update(&self, _high_accuracy: bool) -> Result<(), String> {
        Ok(())
    }

    fn location_services_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn authorization(&self) -> AuthorizationStatus {
        *self.authorization.lock()
    }

    fn last_known_location(&self) -> Option<Location> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_core::ActivityType;
    use std::io::Write;

    #[test]
    fn test_parse_script() {
        let script = r#"
# morning commute
{"fix": {"latitude": 52.52, "longitude": 13.40, "accuracy": 8.0}}
{"fix": {"provider": "network", "time": 5000, "latitude": 52.53, "longitude": 13.41}}

{"activity": {"type": "STILL", "confidence": 90}}
{"signal": "Backgrounded"}
{"services": false}
{"authorization": 2}
"#;
        let lines = parse_script(script).unwrap();
        assert_eq!(lines.len(), 6);

        let ReplayLine::Fix(fix) = lines[0].clone() else {
            panic!("expected a fix");
        };
        let location = fix.into_location(1_000);
        assert_eq!(location.provider, "gps");
        assert_eq!(location.time, 1_000);
        assert_eq!(location.accuracy, Some(8.0));

        let ReplayLine::Fix(fix) = lines[1].clone() else {
            panic!("expected a fix");
        };
        assert_eq!(fix.into_location(1_000).time, 5_000);

        assert_eq!(
            lines[2],
            ReplayLine::Activity(ActivityObservation::new(ActivityType::Still, 90))
        );
        assert_eq!(lines[3], ReplayLine::Signal(HostSignal::Backgrounded));
        assert_eq!(lines[4], ReplayLine::Services(false));
        assert_eq!(lines[5], ReplayLine::Authorization(2));
    }

    #[test]
    fn test_bad_line_is_reported() {
        let err = parse_script("{\"fix\": {\"latitude\": 1.0, \"longitude\": 2.0}}\n{\"teleport\": 1}\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_read_script_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"services\": true}}").unwrap();
        let lines = read_script(file.path()).unwrap();
        assert_eq!(lines, vec![ReplayLine::Services(true)]);
    }

    #[test]
    fn test_source_records_requests() {
        let source = ReplaySource::new();
        let request = ProviderRequest {
            interval_ms: 1_000,
            fastest_interval_ms: 500,
            accuracy: geotrack_core::Accuracy::High,
            activities_interval_ms: 10_000,
        };
        source.request_updates(&request).unwrap();
        assert_eq!(source.current_request(), Some(request));

        source.stop_updates();
        assert_eq!(source.current_request(), None);
        assert_eq!(source.request_history().len(), 1);

        source.set_enabled(false);
        assert!(source.request_updates(&request).is_err());
        assert!(authorization_from_id(3).is_err());
    }
}
