mod backend;
pub mod backends;
pub mod filter;
mod result;

pub use backend::{Detector, ScanParams};
pub use backends::{detector_by_name, ContrastDetector, StubDetector};
pub use filter::{FilterChain, Polygon, RegionFilter};
pub use result::{DetectionResult, RawRegion, Region};
