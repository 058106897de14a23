// Activity observations from the optional activity source

use serde::{Deserialize, Serialize};

/// Activity type reported by activity recognition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    InVehicle,
    OnBicycle,
    OnFoot,
    Running,
    Still,
    Tilting,
    Unknown,
    Walking,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActivityType::InVehicle => "IN_VEHICLE",
            ActivityType::OnBicycle => "ON_BICYCLE",
            ActivityType::OnFoot => "ON_FOOT",
            ActivityType::Running => "RUNNING",
            ActivityType::Still => "STILL",
            ActivityType::Tilting => "TILTING",
            ActivityType::Unknown => "UNKNOWN",
            ActivityType::Walking => "WALKING",
        };
        write!(f, "{}", name)
    }
}

/// One activity reading. Consumed by the classifier and then discarded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityObservation {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    /// Likelihood in percent (0-100)
    pub confidence: u8,
}

impl ActivityObservation {
    pub fn new(activity_type: ActivityType, confidence: u8) -> Self {
        Self {
            activity_type,
            confidence: confidence.min(100),
        }
    }

    /// STILL with at least `min_confidence` percent
    pub fn is_confident_still(&self, min_confidence: u8) -> bool {
        self.activity_type == ActivityType::Still && self.confidence >= min_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_host_names() {
        let obs = ActivityObservation::new(ActivityType::InVehicle, 80);
        let json = serde_json::to_value(obs).unwrap();
        assert_eq!(json["type"], "IN_VEHICLE");
        assert_eq!(json["confidence"], 80);
    }

    #[test]
    fn test_confident_still() {
        assert!(ActivityObservation::new(ActivityType::Still, 90).is_confident_still(75));
        assert!(!ActivityObservation::new(ActivityType::Still, 50).is_confident_still(75));
        assert!(!ActivityObservation::new(ActivityType::Walking, 100).is_confident_still(75));
        assert_eq!(ActivityObservation::new(ActivityType::Tilting, 200).confidence, 100);
    }
}
