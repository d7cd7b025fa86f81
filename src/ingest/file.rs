//! Image-file capture source.
//!
//! The camera process writes each frame to a new file and repoints a fixed
//! path (the `imagefile` camera setting) at it. Polling resolves that path;
//! a changed target is a new frame.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use super::{CaptureSource, CapturedUnit, UnitIdentity};
use crate::frame::{parse_frame_time, wall_clock, Frame, FrameData};
use crate::settings::{CameraSettings, SettingsStore};

pub struct FileWatchSource {
    camera: Arc<SettingsStore>,
    last: Option<PathBuf>,
    sequence: u64,
}

impl FileWatchSource {
    pub fn new(camera: Arc<SettingsStore>) -> Self {
        Self {
            camera,
            last: None,
            sequence: 0,
        }
    }
}

impl CaptureSource for FileWatchSource {
    fn describe(&self) -> String {
        let settings = CameraSettings::snapshot(&self.camera);
        format!("file watch {:?}", settings.imagefile)
    }

    fn poll(&mut self) -> Result<Option<CapturedUnit>> {
        let settings = CameraSettings::snapshot(&self.camera);
        if settings.imagefile.is_empty() {
            return Ok(None);
        }
        let path = std::fs::canonicalize(&settings.imagefile)
            .with_context(|| format!("cannot resolve {}", settings.imagefile))?;
        if self.last.as_ref() != Some(&path) {
            self.sequence += 1;
            self.last = Some(path.clone());
        }
        let capture_timestamp = if settings.ignore_timestamps {
            wall_clock()
        } else {
            parse_frame_time(&path).unwrap_or_else(|err| {
                log::debug!("using wall clock for {}: {}", path.display(), err);
                wall_clock()
            })
        };
        Ok(Some(CapturedUnit {
            identity: UnitIdentity::Path(path.clone()),
            frame: Frame {
                capture_timestamp,
                sequence: self.sequence,
                data: FrameData::File(path),
            },
        }))
    }
}
