use anyhow::Result;

use crate::detect::backend::{Detector, ScanParams};
use crate::detect::result::RawRegion;
use crate::frame::Image;

/// Stub detector for testing. Returns the same regions for every frame.
#[derive(Clone, Debug, Default)]
pub struct StubDetector {
    regions: Vec<RawRegion>,
    scans: u64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regions(regions: Vec<RawRegion>) -> Self {
        Self { regions, scans: 0 }
    }

    pub fn scans(&self) -> u64 {
        self.scans
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn scan(&mut self, _image: &Image, _params: &ScanParams) -> Result<Vec<RawRegion>> {
        self.scans += 1;
        Ok(self.regions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, PixelFormat};

    #[test]
    fn stub_detector_repeats_regions() {
        let region = RawRegion {
            bbox: BoundingBox {
                x1: 0,
                y1: 0,
                x2: 4,
                y2: 4,
            },
            score: 350.0,
        };
        let mut detector = StubDetector::with_regions(vec![region.clone()]);
        let image = Image::zeroed(8, 8, PixelFormat::Mono8);
        let params = ScanParams::default();
        assert_eq!(detector.scan(&image, &params).unwrap(), vec![region.clone()]);
        assert_eq!(detector.scan(&image, &params).unwrap(), vec![region]);
        assert_eq!(detector.scans(), 2);
    }
}
