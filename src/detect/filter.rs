//! Ordered, composable region filters.
//!
//! Every filter is idempotent. Geographic filters need each region's
//! lat/lon, so a chain skips them for frames without a position fix.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::detect::result::Region;
use crate::position::distance_m;

/// Keep regions scoring at least `min_score`.
pub fn filter_by_score(regions: Vec<Region>, min_score: f64) -> Vec<Region> {
    regions.into_iter().filter(|r| r.score >= min_score).collect()
}

/// Keep regions within `radius_m` metres of `center`. Regions without a
/// location are kept.
pub fn filter_radius(regions: Vec<Region>, center: (f64, f64), radius_m: f64) -> Vec<Region> {
    regions
        .into_iter()
        .filter(|r| r.latlon.map_or(true, |ll| distance_m(ll, center) <= radius_m))
        .collect()
}

/// Keep regions inside `polygon`. Regions without a location are kept.
pub fn filter_boundary(regions: Vec<Region>, polygon: &Polygon) -> Vec<Region> {
    regions
        .into_iter()
        .filter(|r| r.latlon.map_or(true, |(lat, lon)| polygon.contains(lat, lon)))
        .collect()
}

/// Search-area boundary as a closed lat/lon polygon.
#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    points: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self> {
        if points.len() < 3 {
            bail!("boundary needs at least 3 points, got {}", points.len());
        }
        Ok(Self { points })
    }

    /// Load a boundary file: one `lat lon` pair per line, `#` comments allowed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read boundary {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid boundary {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut points = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|f| !f.is_empty());
            let mut next = || -> Result<f64> {
                fields
                    .next()
                    .ok_or_else(|| anyhow!("line {}: expected 'lat lon'", lineno + 1))?
                    .parse::<f64>()
                    .map_err(|e| anyhow!("line {}: {}", lineno + 1, e))
            };
            let lat = next()?;
            let lon = next()?;
            points.push((lat, lon));
        }
        Self::new(points)
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let (yi, xi) = self.points[i];
            let (yj, xj) = self.points[j];
            if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

#[derive(Clone, Debug)]
pub enum RegionFilter {
    Score(f64),
    Radius { center: (f64, f64), radius_m: f64 },
    Boundary(Arc<Polygon>),
}

impl RegionFilter {
    pub fn is_geographic(&self) -> bool {
        !matches!(self, RegionFilter::Score(_))
    }

    pub fn apply(&self, regions: Vec<Region>) -> Vec<Region> {
        match self {
            RegionFilter::Score(min) => filter_by_score(regions, *min),
            RegionFilter::Radius { center, radius_m } => filter_radius(regions, *center, *radius_m),
            RegionFilter::Boundary(polygon) => filter_boundary(regions, polygon),
        }
    }
}

/// Filters applied in insertion order.
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    filters: Vec<RegionFilter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, filter: RegionFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain. Geographic filters are skipped when `have_position` is false.
    pub fn apply(&self, mut regions: Vec<Region>, have_position: bool) -> Vec<Region> {
        for filter in &self.filters {
            if filter.is_geographic() && !have_position {
                continue;
            }
            regions = filter.apply(regions);
        }
        regions
    }
}
