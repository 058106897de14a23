// Geodesic helpers

/// Mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two WGS 84 coordinates, in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Latitude reached by moving `meters` due north from `lat`
pub fn offset_north(lat: f64, meters: f64) -> f64 {
    lat + (meters / EARTH_RADIUS_M).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_m(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn test_offset_north_matches_haversine() {
        let lat = offset_north(45.0, 60.0);
        let d = haversine_m(45.0, 7.0, lat, 7.0);
        assert!((d - 60.0).abs() < 1e-6, "distance was {}", d);
    }

    #[test]
    fn test_known_distance() {
        // Berlin to Munich is roughly 504 km
        let d = haversine_m(52.5200, 13.4050, 48.1351, 11.5820);
        assert!((d - 504_000.0).abs() < 5_000.0, "distance was {}", d);
    }
}
