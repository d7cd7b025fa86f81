//! Aircraft position lookup by frame timestamp.
//!
//! The pipeline only depends on `PositionSource`. `PositionHistory` is the
//! in-process implementation fed by the host's telemetry stream.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

use crate::frame::Timestamp;

const EARTH_RADIUS_M: f64 = 6_378_100.0;

/// Aircraft pose at an instant. Angles in degrees, altitude in metres above ground.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub time: Timestamp,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("no fix near timestamp {timestamp:.2}")]
    NoFix { timestamp: Timestamp },
    #[error("roll {roll:.1} exceeds limit {limit:.1}")]
    RollLimit { roll: f64, limit: f64 },
}

pub trait PositionSource: Send + Sync {
    /// Position at `timestamp - sensor_lag`.
    ///
    /// `roll` overrides the recorded roll (stabilised mounts pass `Some(0.0)`);
    /// a resulting roll beyond `max_roll` degrees is an error.
    fn position_at(
        &self,
        timestamp: Timestamp,
        sensor_lag: f64,
        roll: Option<f64>,
        max_roll: f64,
    ) -> Result<Position, PositionError>;
}

/// Source that never has a fix.
pub struct NoPositionSource;

impl PositionSource for NoPositionSource {
    fn position_at(
        &self,
        timestamp: Timestamp,
        _sensor_lag: f64,
        _roll: Option<f64>,
        _max_roll: f64,
    ) -> Result<Position, PositionError> {
        Err(PositionError::NoFix { timestamp })
    }
}

/// Bounded, time-ordered backlog of fixes with linear interpolation.
pub struct PositionHistory {
    fixes: Mutex<VecDeque<Position>>,
    backlog: usize,
    max_gap: f64,
}

impl PositionHistory {
    pub const DEFAULT_BACKLOG: usize = 5000;

    pub fn new(backlog: usize, max_gap: f64) -> Self {
        Self {
            fixes: Mutex::new(VecDeque::with_capacity(backlog.min(8192))),
            backlog: backlog.max(2),
            max_gap,
        }
    }

    pub fn add_fix(&self, fix: Position) {
        let mut fixes = self.fixes.lock().unwrap_or_else(|p| p.into_inner());
        let idx = fixes.partition_point(|f| f.time <= fix.time);
        fixes.insert(idx, fix);
        while fixes.len() > self.backlog {
            fixes.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.fixes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PositionHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BACKLOG, 1.0)
    }
}

impl PositionSource for PositionHistory {
    fn position_at(
        &self,
        timestamp: Timestamp,
        sensor_lag: f64,
        roll: Option<f64>,
        max_roll: f64,
    ) -> Result<Position, PositionError> {
        let t = timestamp - sensor_lag;
        let fixes = self.fixes.lock().unwrap_or_else(|p| p.into_inner());
        let idx = fixes.partition_point(|f| f.time <= t);
        let before = idx.checked_sub(1).and_then(|i| fixes.get(i));
        let after = fixes.get(idx);
        let near = |f: &&Position| (f.time - t).abs() <= self.max_gap;

        let mut pos = match (before.filter(near), after.filter(near)) {
            (Some(a), Some(b)) => interpolate(a, b, t),
            (Some(a), None) => *a,
            (None, Some(b)) => *b,
            (None, None) => return Err(PositionError::NoFix { timestamp }),
        };
        if let Some(roll) = roll {
            pos.roll = roll;
        }
        if max_roll > 0.0 && pos.roll.abs() > max_roll {
            return Err(PositionError::RollLimit {
                roll: pos.roll,
                limit: max_roll,
            });
        }
        Ok(pos)
    }
}

fn interpolate(a: &Position, b: &Position, t: Timestamp) -> Position {
    let span = b.time - a.time;
    if span <= 0.0 {
        return *a;
    }
    let k = (t - a.time) / span;
    let lerp = |x: f64, y: f64| x + (y - x) * k;
    let mut dyaw = b.yaw - a.yaw;
    if dyaw > 180.0 {
        dyaw -= 360.0;
    } else if dyaw < -180.0 {
        dyaw += 360.0;
    }
    Position {
        time: t,
        lat: lerp(a.lat, b.lat),
        lon: lerp(a.lon, b.lon),
        altitude: lerp(a.altitude, b.altitude),
        roll: lerp(a.roll, b.roll),
        pitch: lerp(a.pitch, b.pitch),
        yaw: (a.yaw + dyaw * k).rem_euclid(360.0),
    }
}

/// Ground location of image pixel (`px`, `py`) for a nadir camera.
///
/// Flat-earth projection: image up is the aircraft heading.
pub fn locate_pixel(
    pos: &Position,
    px: f64,
    py: f64,
    width: u32,
    height: u32,
    meters_per_pixel: f64,
) -> (f64, f64) {
    let right = (px - width as f64 / 2.0) * meters_per_pixel;
    let forward = (height as f64 / 2.0 - py) * meters_per_pixel;
    let yaw = pos.yaw.to_radians();
    let north = forward * yaw.cos() - right * yaw.sin();
    let east = forward * yaw.sin() + right * yaw.cos();
    offset(pos.lat, pos.lon, north, east)
}

/// Move (`lat`, `lon`) by metres north/east.
pub fn offset(lat: f64, lon: f64, north: f64, east: f64) -> (f64, f64) {
    let dlat = (north / EARTH_RADIUS_M).to_degrees();
    let dlon = (east / (EARTH_RADIUS_M * lat.to_radians().cos())).to_degrees();
    (lat + dlat, lon + dlon)
}

/// Great-circle distance in metres.
pub fn distance_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(time: f64, lat: f64, yaw: f64, roll: f64) -> Position {
        Position {
            time,
            lat,
            lon: 149.0,
            altitude: 100.0,
            roll,
            pitch: 0.0,
            yaw,
        }
    }

    #[test]
    fn interpolates_between_bracketing_fixes() {
        let history = PositionHistory::default();
        history.add_fix(fix(10.0, -35.0, 350.0, 0.0));
        history.add_fix(fix(11.0, -35.001, 10.0, 0.0));
        let pos = history.position_at(10.5, 0.0, None, 45.0).unwrap();
        assert!((pos.lat + 35.0005).abs() < 1e-9);
        // Heading interpolates across north, not through south.
        assert!(pos.yaw < 1e-9 || pos.yaw > 359.999);
    }

    #[test]
    fn no_fix_when_history_is_stale() {
        let history = PositionHistory::default();
        history.add_fix(fix(10.0, -35.0, 0.0, 0.0));
        assert_eq!(
            history.position_at(20.0, 0.0, None, 45.0),
            Err(PositionError::NoFix { timestamp: 20.0 })
        );
    }

    #[test]
    fn roll_override_and_limit() {
        let history = PositionHistory::default();
        history.add_fix(fix(10.0, -35.0, 0.0, 50.0));
        assert!(matches!(
            history.position_at(10.0, 0.0, None, 30.0),
            Err(PositionError::RollLimit { .. })
        ));
        let pos = history.position_at(10.0, 0.0, Some(0.0), 30.0).unwrap();
        assert_eq!(pos.roll, 0.0);
    }

    #[test]
    fn backlog_is_bounded() {
        let history = PositionHistory::new(3, 1.0);
        for i in 0..10 {
            history.add_fix(fix(i as f64, -35.0, 0.0, 0.0));
        }
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn pixel_north_of_center_moves_north_when_heading_north() {
        let pos = fix(0.0, -35.0, 0.0, 0.0);
        let (lat, lon) = locate_pixel(&pos, 640.0, 0.0, 1280, 960, 0.1);
        assert!(lat > pos.lat);
        assert!((lon - pos.lon).abs() < 1e-9);
        let d = distance_m((pos.lat, pos.lon), (lat, lon));
        assert!((d - 48.0).abs() < 0.1);
    }
}
