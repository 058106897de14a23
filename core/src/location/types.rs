// Location records: raw fixes and persisted samples

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Location provider configured for the pipeline (stamped on every sample)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocationProviderKind {
    /// Distance-filter driven tracking
    #[default]
    DistanceFilter,
    /// Activity recognition driven tracking
    Activity,
    /// Raw provider pass-through
    Raw,
}

impl LocationProviderKind {
    /// Numeric id used by host bindings (0, 1, 2)
    pub fn as_id(&self) -> u8 {
        match self {
            Self::DistanceFilter => 0,
            Self::Activity => 1,
            Self::Raw => 2,
        }
    }
}

impl std::fmt::Display for LocationProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DistanceFilter => write!(f, "DistanceFilter"),
            Self::Activity => write!(f, "Activity"),
            Self::Raw => write!(f, "Raw"),
        }
    }
}

/// Mock-provider information, only present when the provider can report it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockInfo {
    /// Fix was produced by a mock provider
    pub is_from_mock_provider: bool,
    /// Device has mock locations enabled
    pub mock_locations_enabled: bool,
}

/// A position reading.
///
/// Raw fixes coming from the [`FixSource`](crate::platform::FixSource) and
/// the location part of persisted samples share this shape. Capabilities
/// differ per provider, so everything past latitude/longitude is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Native provider tag ("gps", "network", "passive", "fused")
    pub provider: String,
    /// Configured provider kind
    pub location_provider: LocationProviderKind,
    /// UTC capture time, milliseconds since the unix epoch
    pub time: u64,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Estimated horizontal accuracy in meters
    pub accuracy: Option<f64>,
    /// Ground speed in m/s
    pub speed: Option<f64>,
    /// Altitude above the WGS 84 ellipsoid in meters
    pub altitude: Option<f64>,
    /// Bearing in degrees
    pub bearing: Option<f64>,
    /// Mock provider flags
    pub mock: Option<MockInfo>,
}

impl Location {
    /// Bare fix with only the mandatory fields set
    pub fn new(provider: &str, time: u64, latitude: f64, longitude: f64) -> Self {
        Self {
            provider: provider.to_string(),
            location_provider: LocationProviderKind::default(),
            time,
            latitude,
            longitude,
            accuracy: None,
            speed: None,
            altitude: None,
            bearing: None,
            mock: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Great-circle distance to another location in meters
    pub fn distance_to(&self, other: &Location) -> f64 {
        super::geo::haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// Host-facing JSON object (camelCase keys, absent values as null)
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("provider".into(), json!(self.provider));
        map.insert("locationProvider".into(), json!(self.location_provider.as_id()));
        map.insert("time".into(), json!(self.time));
        map.insert("latitude".into(), json!(self.latitude));
        map.insert("longitude".into(), json!(self.longitude));
        map.insert("accuracy".into(), json!(self.accuracy));
        map.insert("speed".into(), json!(self.speed));
        map.insert("altitude".into(), json!(self.altitude));
        map.insert("bearing".into(), json!(self.bearing));
        if let Some(mock) = &self.mock {
            map.insert("isFromMockProvider".into(), json!(mock.is_from_mock_provider));
            map.insert("mockLocationsEnabled".into(), json!(mock.mock_locations_enabled));
        }
        map
    }
}

/// Sync status of a stored sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Not yet delivered (or a retry is in progress)
    Pending,
    /// Delivered to the collector
    Synced,
    /// Last delivery attempt failed
    Failed,
}

impl SyncStatus {
    /// Whether the sample still needs delivery
    pub fn is_unsynced(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "PENDING"),
            SyncStatus::Synced => write!(f, "SYNCED"),
            SyncStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// An accepted, persisted location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Local id, monotonically increasing and never reused
    pub id: u64,
    pub location: Location,
    pub status: SyncStatus,
}

impl LocationSample {
    /// Location object plus `id` and `status`
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = self.location.to_json();
        map.insert("id".into(), json!(self.id));
        map.insert("status".into(), json!(self.status.to_string()));
        map
    }
}

/// Zone the device must leave to be considered moving again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationaryRegion {
    pub anchor: Location,
    /// Radius in meters
    pub radius: f64,
}

impl StationaryRegion {
    /// True when `location` lies strictly outside the region
    pub fn is_exited_by(&self, location: &Location) -> bool {
        self.anchor.distance_to(location) > self.radius
    }
}
