use serde::{Deserialize, Serialize};

use crate::frame::{BoundingBox, Timestamp};
use crate::position::Position;

/// Region as returned by a detector, before any filtering.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRegion {
    pub bbox: BoundingBox,
    pub score: f64,
}

/// Scored region with its ground location when the aircraft position was known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub bbox: BoundingBox,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latlon: Option<(f64, f64)>,
}

impl From<RawRegion> for Region {
    fn from(raw: RawRegion) -> Self {
        Self {
            bbox: raw.bbox,
            score: raw.score,
            latlon: None,
        }
    }
}

/// Regions found in one frame. Immutable once the scan stage hands it on.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub frame_timestamp: Timestamp,
    pub position: Option<Position>,
    pub regions: Vec<Region>,
}

impl DetectionResult {
    pub fn max_score(&self) -> f64 {
        self.regions
            .iter()
            .map(|r| r.score)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
