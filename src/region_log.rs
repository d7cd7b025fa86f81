//! Append-only newline-delimited record of processed frames.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::detect::{DetectionResult, Region};
use crate::frame::{frame_time_label, Timestamp};
use crate::position::Position;

#[derive(Serialize)]
struct Record<'a> {
    timestamp: Timestamp,
    frame: String,
    position: Option<&'a Position>,
    regions: &'a [Region],
}

pub struct RegionLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RegionLog {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open region log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line for `result`. Each record is flushed before returning.
    pub fn append(&self, result: &DetectionResult) -> Result<()> {
        let record = Record {
            timestamp: result.frame_timestamp,
            frame: frame_time_label(result.frame_timestamp),
            position: result.position.as_ref(),
            regions: &result.regions,
        };
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BoundingBox;

    #[test]
    fn appends_one_line_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("regions.ndjson");
        let log = RegionLog::open(&path).unwrap();
        let result = DetectionResult {
            frame_timestamp: 1_700_000_000.25,
            position: None,
            regions: vec![Region {
                bbox: BoundingBox {
                    x1: 1,
                    y1: 2,
                    x2: 3,
                    y2: 4,
                },
                score: 512.0,
                latlon: Some((-35.0, 149.0)),
            }],
        };
        log.append(&result).unwrap();
        log.append(&result).unwrap();
        drop(log);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000.25);
        assert_eq!(value["regions"][0]["score"], 512.0);
        assert!(value["position"].is_null());
    }
}
