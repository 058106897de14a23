// Location module: fixes, samples and geodesic math

pub mod geo;
pub mod types;

pub use types::{
    Location, LocationProviderKind, LocationSample, MockInfo, StationaryRegion, SyncStatus,
};
