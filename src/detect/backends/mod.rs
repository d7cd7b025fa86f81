pub mod contrast;
pub mod stub;

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;

pub use contrast::ContrastDetector;
pub use stub::StubDetector;

/// Names accepted by `detector_by_name`.
pub const DETECTOR_NAMES: &[&str] = &["contrast", "stub"];

/// Build a detector from its configured name.
pub fn detector_by_name(name: &str) -> Result<Box<dyn Detector>> {
    match name {
        "contrast" => Ok(Box::new(ContrastDetector::new())),
        "stub" => Ok(Box::new(StubDetector::new())),
        other => Err(anyhow!(
            "unknown detector '{}' (expected one of {:?})",
            other,
            DETECTOR_NAMES
        )),
    }
}
