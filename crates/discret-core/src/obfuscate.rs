use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use discret_shared::error::GeoError;
use discret_shared::geo::{self, RawCoordinates};
use discret_shared::types::MovementState;

/// What the rest of the platform sees instead of a GPS fix. Producing one
/// is one-way within the public surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObfuscatedLocation {
    pub zone_id: String,
    pub approx_time: DateTime<Utc>,
    pub movement_state: MovementState,
    pub resolution: u8,
}

/// Pure transform: raw fix → zone cell at a bounded resolution.
/// Movement state is unknown at this layer; history-aware callers set it.
pub fn obfuscate(raw: &RawCoordinates, resolution: u8) -> Result<ObfuscatedLocation, GeoError> {
    let resolution = geo::clamp_resolution(resolution);
    let zone_id = geo::zone_for(raw, resolution)?;

    // Timestamps are floored to a 5-minute bucket.
    let approx_time = Utc::now()
        .duration_trunc(TimeDelta::minutes(5))
        .unwrap_or_else(|_| Utc::now());

    Ok(ObfuscatedLocation {
        zone_id,
        approx_time,
        movement_state: MovementState::Unknown,
        resolution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_obfuscate_clamps_resolution() {
        let raw = RawCoordinates::new(-1.286, 36.817).unwrap();
        let ob = obfuscate(&raw, 15).unwrap();
        assert_eq!(ob.resolution, 9);

        let ob = obfuscate(&raw, 1).unwrap();
        assert_eq!(ob.resolution, 7);
    }

    #[test]
    fn test_obfuscate_drops_raw_fields() {
        let raw = RawCoordinates::new(-1.286, 36.817).unwrap();
        let ob = obfuscate(&raw, 8).unwrap();
        let json = serde_json::to_string(&ob).unwrap();
        assert!(!json.contains("latitude"));
        assert!(!json.contains("longitude"));
        assert!(json.contains("zone_id"));
    }

    #[test]
    fn test_movement_state_unknown_at_this_layer() {
        let raw = RawCoordinates::new(51.5, -0.12).unwrap();
        let ob = obfuscate(&raw, 8).unwrap();
        assert_eq!(ob.movement_state, MovementState::Unknown);
    }

    #[test]
    fn test_approx_time_bucketed() {
        let raw = RawCoordinates::new(51.5, -0.12).unwrap();
        let ob = obfuscate(&raw, 8).unwrap();
        assert_eq!(ob.approx_time.minute() % 5, 0);
        assert_eq!(ob.approx_time.second(), 0);
    }

    #[test]
    fn test_deterministic_zone_for_same_block() {
        let a = RawCoordinates::new(-1.286, 36.817).unwrap();
        let b = RawCoordinates::new(-1.28605, 36.81705).unwrap();
        assert_eq!(
            obfuscate(&a, 8).unwrap().zone_id,
            obfuscate(&b, 8).unwrap().zone_id
        );
    }
}
