//! Capture sources and the capture loop.
//!
//! A `CaptureSource` yields captured units; the capture loop turns each new
//! unit into a `Frame` on the downstream queue. A unit is only enqueued when
//! its identity differs from the previous one, so re-polling a source that
//! has nothing new never produces a duplicate frame.
//!
//! Sources:
//! - `FileWatchSource`: follows the image file the camera process keeps
//!   repointing.
//! - `DeviceCaptureSource`: drives a triggered frame grabber through the
//!   `FrameSource` contract.
//! - `SyntheticFrameSource`: `stub://` frame grabber for tests and bench runs.

pub mod device;
pub mod file;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, ImageIndex};
use crate::queue::{BoundedStageQueue, StopSignal};
use crate::stage::StageCounters;

pub use device::{CaptureInfo, DeviceCaptureSource, FrameSource, SyntheticFrameSource};
pub use file::FileWatchSource;

/// What makes a captured unit distinct from the previous one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitIdentity {
    Path(PathBuf),
    Sequence(u64),
}

#[derive(Clone, Debug)]
pub struct CapturedUnit {
    pub identity: UnitIdentity,
    pub frame: Frame,
}

pub trait CaptureSource: Send {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Current unit, if any. May return the same identity repeatedly.
    fn poll(&mut self) -> Result<Option<CapturedUnit>>;

    /// Close and reopen the underlying input after repeated failures.
    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    /// Frames the source knows it missed since the last call.
    fn take_lost(&mut self) -> u64 {
        0
    }
}

#[derive(Clone, Debug)]
pub struct CaptureOptions {
    /// Idle wait between polls that produced nothing new.
    pub poll: Duration,
    /// Consecutive failures before the source is reopened.
    pub reopen_threshold: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Queue depth at which new frames are shed.
    pub shed_threshold: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(10),
            reopen_threshold: 5,
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            shed_threshold: crate::queue::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Capture loop. Runs until `stop` is raised.
pub fn run_capture(
    source: &mut dyn CaptureSource,
    out: &BoundedStageQueue<Frame>,
    index: Option<&Arc<ImageIndex>>,
    counters: &StageCounters,
    stop: &StopSignal,
    opts: &CaptureOptions,
) {
    log::info!("capture started on {}", source.describe());
    let mut last: Option<UnitIdentity> = None;
    let mut failures = 0u32;
    let mut backoff = opts.backoff;

    while !stop.is_set() {
        match source.poll() {
            Ok(Some(unit)) => {
                failures = 0;
                backoff = opts.backoff;
                let lost = source.take_lost();
                if lost > 0 {
                    StageCounters::add(&counters.frames_lost, lost);
                }
                if last.as_ref() == Some(&unit.identity) {
                    stop.wait(opts.poll);
                    continue;
                }
                last = Some(unit.identity);
                let frame = unit.frame;
                if let (Some(index), Some(path)) = (index, frame.path()) {
                    index.record(frame.capture_timestamp, path.to_path_buf());
                }
                if out.len() >= opts.shed_threshold || !out.push(frame) {
                    StageCounters::bump(&counters.capture_shed);
                    log::warn!("capture: scan queue full, shedding frame");
                } else {
                    StageCounters::bump(&counters.captured);
                }
            }
            Ok(None) => {
                stop.wait(opts.poll);
            }
            Err(err) => {
                StageCounters::bump(&counters.capture_errors);
                failures += 1;
                log::warn!("capture: {} ({} consecutive)", err, failures);
                if failures < opts.reopen_threshold {
                    stop.wait(opts.poll);
                    continue;
                }
                if stop.wait(backoff) {
                    break;
                }
                backoff = (backoff * 2).min(opts.max_backoff);
                match source.reopen() {
                    Ok(()) => {
                        log::info!("capture: reopened {}", source.describe());
                        failures = 0;
                    }
                    Err(err) => log::warn!("capture: reopen failed: {}", err),
                }
            }
        }
    }
    log::info!("capture stopped");
}
