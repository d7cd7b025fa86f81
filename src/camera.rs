//! Camera intrinsics used for ground-resolution and region geolocation.

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::Path;

/// Lens/sensor description loaded from the camera parameters file.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CameraParams {
    /// Focal length in millimetres.
    pub lens: f64,
    /// Sensor width in millimetres.
    #[serde(alias = "sensorwidth")]
    pub sensor_width: f64,
    /// Image width in pixels.
    #[serde(alias = "xresolution")]
    pub x_resolution: u32,
    /// Image height in pixels.
    #[serde(alias = "yresolution")]
    pub y_resolution: u32,
}

impl CameraParams {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read camera params {}: {}", path.display(), e))?;
        Self::from_json(&raw).map_err(|e| anyhow!("camera params {}: {}", path.display(), e))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let params: CameraParams = serde_json::from_str(raw)?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if !(self.lens > 0.0) {
            bail!("lens must be > 0");
        }
        if !(self.sensor_width > 0.0) {
            bail!("sensor width must be > 0");
        }
        if self.x_resolution == 0 || self.y_resolution == 0 {
            bail!("resolution must be non-zero");
        }
        Ok(())
    }

    /// Ground size of one pixel in metres at `altitude` metres.
    pub fn meters_per_pixel(&self, altitude: f64) -> f64 {
        altitude * self.sensor_width / (self.lens * self.x_resolution as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_legacy_field_names() {
        let params = CameraParams::from_json(
            r#"{"lens": 4.0, "sensorwidth": 5.0, "xresolution": 1280, "yresolution": 960}"#,
        )
        .unwrap();
        assert_eq!(params.x_resolution, 1280);
        let mpp = params.meters_per_pixel(100.0);
        assert!((mpp - 100.0 * 5.0 / (4.0 * 1280.0)).abs() < 1e-12);
    }

    #[test]
    fn rejects_degenerate_params() {
        assert!(CameraParams::from_json(
            r#"{"lens": 0.0, "sensor_width": 5.0, "x_resolution": 1280, "y_resolution": 960}"#
        )
        .is_err());
        assert!(CameraParams::from_json("not json").is_err());
    }
}
