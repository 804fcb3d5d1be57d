use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_ZONE_RESOLUTION, MIN_ZONE_RESOLUTION};
use crate::error::GeoError;

/// WGS-84 mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Raw GPS fix. Lives only in transient obfuscator input and emergency
/// records; never serialized onto the public surface outside that path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RawCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl RawCoordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Haversine great-circle distance in meters.
pub fn haversine_distance_m(a: &RawCoordinates, b: &RawCoordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Initial bearing from `a` to `b`, normalised to [0, 360).
pub fn bearing_deg(a: &RawCoordinates, b: &RawCoordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

pub fn clamp_resolution(resolution: u8) -> u8 {
    resolution.clamp(MIN_ZONE_RESOLUTION, MAX_ZONE_RESOLUTION)
}

/// Hex cell covering the fix at the clamped resolution.
pub fn zone_for(coords: &RawCoordinates, resolution: u8) -> Result<String, GeoError> {
    let res = Resolution::try_from(clamp_resolution(resolution))
        .map_err(|e| GeoError::InvalidZoneId(e.to_string()))?;
    let latlng = LatLng::new(coords.latitude, coords.longitude)
        .map_err(|_| GeoError::LatitudeOutOfRange(coords.latitude))?;
    Ok(latlng.to_cell(res).to_string())
}

/// Centroid of a zone cell. The only reverse mapping; intentionally coarse.
pub fn zone_center(zone_id: &str) -> Result<RawCoordinates, GeoError> {
    let cell: CellIndex = zone_id
        .parse()
        .map_err(|_| GeoError::InvalidZoneId(zone_id.to_string()))?;
    let center = LatLng::from(cell);
    RawCoordinates::new(center.lat(), center.lng())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinates_validated() {
        assert!(RawCoordinates::new(-1.286, 36.817).is_ok());
        assert!(RawCoordinates::new(91.0, 0.0).is_err());
        assert!(RawCoordinates::new(0.0, -181.0).is_err());
    }

    #[test]
    fn test_haversine_nairobi_block() {
        // Two fixes ~16 m apart in central Nairobi
        let a = RawCoordinates::new(-1.286, 36.817).unwrap();
        let b = RawCoordinates::new(-1.2861, 36.8171).unwrap();
        let d = haversine_distance_m(&a, &b);
        assert!(d > 10.0 && d < 25.0, "distance was {d}");
    }

    #[test]
    fn test_haversine_zero() {
        let a = RawCoordinates::new(51.5, -0.12).unwrap();
        assert_eq!(haversine_distance_m(&a, &a), 0.0);
    }

    #[test]
    fn test_bearing_normalised() {
        let a = RawCoordinates::new(0.0, 0.0).unwrap();
        let north = RawCoordinates::new(1.0, 0.0).unwrap();
        let west = RawCoordinates::new(0.0, -1.0).unwrap();

        assert!(bearing_deg(&a, &north).abs() < 0.01);
        let b = bearing_deg(&a, &west);
        assert!((0.0..360.0).contains(&b));
        assert!((b - 270.0).abs() < 0.01);
    }

    #[test]
    fn test_resolution_clamped() {
        assert_eq!(clamp_resolution(3), 7);
        assert_eq!(clamp_resolution(8), 8);
        assert_eq!(clamp_resolution(15), 9);
    }

    #[test]
    fn test_zone_roundtrip_is_coarse() {
        let fix = RawCoordinates::new(-1.286, 36.817).unwrap();
        let zone = zone_for(&fix, 8).unwrap();
        let center = zone_center(&zone).unwrap();

        // Center is near the fix but not the fix itself
        let d = haversine_distance_m(&fix, &center);
        assert!(d < 1000.0);
        assert_ne!((center.latitude, center.longitude), (-1.286, 36.817));
    }

    #[test]
    fn test_same_block_same_zone() {
        let a = RawCoordinates::new(-1.286, 36.817).unwrap();
        let b = RawCoordinates::new(-1.2861, 36.8171).unwrap();
        assert_eq!(zone_for(&a, 8).unwrap(), zone_for(&b, 8).unwrap());
    }

    #[test]
    fn test_bad_zone_id_rejected() {
        assert!(zone_center("not-a-zone").is_err());
    }
}
