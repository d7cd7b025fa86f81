//! Triggered frame-grabber capture.

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

use super::{CaptureSource, CapturedUnit, UnitIdentity};
use crate::frame::{wall_clock, Frame, FrameData, Image, PixelFormat};

/// Device clock period; timestamps wrap back to zero after this many seconds.
pub const DEVICE_CLOCK_WRAP: f64 = 128.0;
/// Consecutive failures tolerated while acquiring the base time before reopening.
const BASE_TIME_REOPEN_AFTER: u32 = 3;
const BASE_TIME_MAX_ATTEMPTS: u32 = 20;

/// Metadata returned with each captured frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureInfo {
    /// Device clock, seconds.
    pub timestamp: f64,
    pub sequence: u64,
    pub exposure: f64,
}

/// Frame-grabber driver contract.
///
/// A handle that keeps failing is recovered by `close` followed by `open`.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<()>;

    /// Arm single-shot (`continuous == false`) or free-running capture.
    fn trigger(&mut self, continuous: bool) -> Result<()>;

    /// Wait up to `timeout` for the next frame and copy it into `out`.
    fn capture(&mut self, timeout: Duration, out: &mut Image) -> Result<CaptureInfo>;

    fn close(&mut self);

    /// Width, height and pixel format of captured frames.
    fn frame_shape(&self) -> (u32, u32, PixelFormat);

    fn describe(&self) -> String;
}

/// `CaptureSource` driving a `FrameSource`.
///
/// The device clock is mapped to wall-clock time with a base time acquired
/// from the first successful single-shot capture. A device timestamp that
/// goes backwards is a clock wrap and advances the base by
/// `DEVICE_CLOCK_WRAP`. Gaps in the device sequence are counted as lost frames.
pub struct DeviceCaptureSource<F: FrameSource> {
    device: F,
    timeout: Duration,
    opened: bool,
    base_time: Option<f64>,
    last_device_time: f64,
    last_sequence: Option<u64>,
    lost: u64,
}

impl<F: FrameSource> DeviceCaptureSource<F> {
    pub fn new(device: F, timeout: Duration) -> Self {
        Self {
            device,
            timeout,
            opened: false,
            base_time: None,
            last_device_time: 0.0,
            last_sequence: None,
            lost: 0,
        }
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    fn blank(&self) -> Image {
        let (width, height, format) = self.device.frame_shape();
        Image::zeroed(width, height, format)
    }

    fn ensure_open(&mut self) -> Result<()> {
        if !self.opened {
            self.device.open()?;
            self.opened = true;
        }
        Ok(())
    }

    fn acquire_base_time(&mut self) -> Result<()> {
        let mut failures = 0;
        let mut image = self.blank();
        for _ in 0..BASE_TIME_MAX_ATTEMPTS {
            let attempt = self
                .device
                .trigger(false)
                .and_then(|()| self.device.capture(self.timeout, &mut image));
            match attempt {
                Ok(info) => {
                    self.base_time = Some(wall_clock() - info.timestamp);
                    self.last_device_time = info.timestamp;
                    self.last_sequence = Some(info.sequence);
                    log::info!("{}: base time acquired", self.device.describe());
                    return self.device.trigger(true);
                }
                Err(err) => {
                    failures += 1;
                    log::debug!("{}: base time capture failed: {}", self.device.describe(), err);
                    if failures > BASE_TIME_REOPEN_AFTER {
                        self.device.close();
                        self.device.open()?;
                        failures = 0;
                    }
                }
            }
        }
        bail!(
            "{}: no frame after {} base time attempts",
            self.device.describe(),
            BASE_TIME_MAX_ATTEMPTS
        )
    }
}

impl<F: FrameSource> CaptureSource for DeviceCaptureSource<F> {
    fn describe(&self) -> String {
        self.device.describe()
    }

    fn poll(&mut self) -> Result<Option<CapturedUnit>> {
        self.ensure_open()?;
        if self.base_time.is_none() {
            self.acquire_base_time()?;
        }
        let mut image = self.blank();
        let info = self.device.capture(self.timeout, &mut image)?;

        let mut base = self
            .base_time
            .ok_or_else(|| anyhow!("base time not acquired"))?;
        if info.timestamp < self.last_device_time {
            base += DEVICE_CLOCK_WRAP;
            self.base_time = Some(base);
        }
        self.last_device_time = info.timestamp;

        if let Some(prev) = self.last_sequence {
            if info.sequence > prev + 1 {
                self.lost += info.sequence - prev - 1;
            }
        }
        self.last_sequence = Some(info.sequence);

        Ok(Some(CapturedUnit {
            identity: UnitIdentity::Sequence(info.sequence),
            frame: Frame {
                capture_timestamp: base + info.timestamp,
                sequence: info.sequence,
                data: FrameData::Pixels(image),
            },
        }))
    }

    fn reopen(&mut self) -> Result<()> {
        if self.opened {
            self.device.close();
            self.opened = false;
        }
        self.base_time = None;
        self.ensure_open()
    }

    fn take_lost(&mut self) -> u64 {
        std::mem::take(&mut self.lost)
    }
}

impl<F: FrameSource> Drop for DeviceCaptureSource<F> {
    fn drop(&mut self) {
        if self.opened {
            self.device.close();
        }
    }
}

/// Synthetic `stub://` frame grabber.
///
/// Produces frames with one bright square drifting across a dark field.
/// The device clock advances by `interval` per frame.
pub struct SyntheticFrameSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    interval: Duration,
    device_time: f64,
    sequence: u64,
    continuous: bool,
    open: bool,
    fail_next: u32,
    skip_every: u64,
}

impl SyntheticFrameSource {
    pub fn new(width: u32, height: u32, format: PixelFormat, interval: Duration) -> Self {
        Self {
            width,
            height,
            format,
            interval,
            device_time: 0.0,
            sequence: 0,
            continuous: false,
            open: false,
            fail_next: 0,
            skip_every: 0,
        }
    }

    /// Fail the next `n` captures.
    pub fn fail_next(mut self, n: u32) -> Self {
        self.fail_next = n;
        self
    }

    /// Drop one sequence number every `n` frames.
    pub fn skip_every(mut self, n: u64) -> Self {
        self.skip_every = n;
        self
    }

    /// Start the device clock near its wrap point.
    pub fn with_device_time(mut self, t: f64) -> Self {
        self.device_time = t;
        self
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    fn paint(&self, out: &mut Image) {
        out.data.iter_mut().for_each(|b| *b = 16);
        let side = (self.width.min(self.height) / 8).max(1);
        let x0 = (self.sequence as u32 * 4) % self.width.saturating_sub(side).max(1);
        let y0 = self.height / 2 - side.min(self.height / 2);
        let bpp = out.format.bytes_per_pixel();
        for y in y0..(y0 + side).min(self.height) {
            for x in x0..(x0 + side).min(self.width) {
                let start = (y as usize * self.width as usize + x as usize) * bpp;
                out.data[start..start + bpp].iter_mut().for_each(|b| *b = 240);
            }
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn trigger(&mut self, continuous: bool) -> Result<()> {
        if !self.open {
            bail!("device not open");
        }
        self.continuous = continuous;
        Ok(())
    }

    fn capture(&mut self, timeout: Duration, out: &mut Image) -> Result<CaptureInfo> {
        if !self.open {
            bail!("device not open");
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval.min(timeout));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            bail!("capture timed out after {:?}", timeout);
        }
        self.sequence += 1;
        if self.skip_every > 0 && self.sequence % self.skip_every == 0 {
            self.sequence += 1;
        }
        self.device_time += self.interval.as_secs_f64().max(0.01);
        if self.device_time >= DEVICE_CLOCK_WRAP {
            self.device_time -= DEVICE_CLOCK_WRAP;
        }
        if out.width != self.width || out.height != self.height || out.format != self.format {
            *out = Image::zeroed(self.width, self.height, self.format);
        }
        self.paint(out);
        Ok(CaptureInfo {
            timestamp: self.device_time,
            sequence: self.sequence,
            exposure: 0.001,
        })
    }

    fn close(&mut self) {
        self.open = false;
        self.continuous = false;
    }

    fn frame_shape(&self) -> (u32, u32, PixelFormat) {
        (self.width, self.height, self.format)
    }

    fn describe(&self) -> String {
        format!("stub://synthetic {}x{}", self.width, self.height)
    }
}
