use anyhow::Result;

use crate::detect::result::RawRegion;
use crate::frame::Image;
use crate::settings::{CameraSettings, ImageSettings};

/// Per-frame detector parameters, copied from the settings stores.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanParams {
    /// Ground size of one pixel in metres.
    pub meters_per_pixel: f64,
    pub min_region_area: f64,
    pub max_region_area: f64,
    pub min_region_size: f64,
    pub max_region_size: f64,
    pub max_rarity_pct: f64,
    pub region_merge_size: f64,
    pub blue_emphasis: bool,
}

impl ScanParams {
    pub fn new(image: &ImageSettings, camera: &CameraSettings, meters_per_pixel: f64) -> Self {
        Self {
            meters_per_pixel,
            min_region_area: image.min_region_area,
            max_region_area: image.max_region_area,
            min_region_size: image.min_region_size,
            max_region_size: image.max_region_size,
            max_rarity_pct: image.max_rarity_pct,
            region_merge_size: image.region_merge_size,
            blue_emphasis: camera.blue_emphasis,
        }
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            meters_per_pixel: 0.25,
            min_region_area: 0.15,
            max_region_area: 1.0,
            min_region_size: 0.2,
            max_region_size: 1.0,
            max_rarity_pct: 0.02,
            region_merge_size: 1.0,
            blue_emphasis: false,
        }
    }
}

/// Region detector.
///
/// Implementations may keep internal buffers between calls but must not
/// depend on earlier frames for their result.
pub trait Detector: Send {
    /// Detector identifier.
    fn name(&self) -> &'static str;

    /// Find candidate regions in a frame.
    fn scan(&mut self, image: &Image, params: &ScanParams) -> Result<Vec<RawRegion>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
