//! Frames and the in-memory image type handed between stages.
//!
//! A `Frame` is owned by exactly one stage at a time and moves through the
//! stage queues. Its capture timestamp is the correlation key used for
//! position lookup, output file names and deduplication.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, with fractional part.
pub type Timestamp = f64;

/// Wall-clock time as a `Timestamp`.
pub fn wall_clock() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Stable map key for a timestamp.
pub fn timestamp_key(t: Timestamp) -> u64 {
    // Fold -0.0 into 0.0 so both spell the same key.
    if t == 0.0 {
        0.0f64.to_bits()
    } else {
        t.to_bits()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    Bayer8,
    Bayer16,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 | PixelFormat::Bayer8 => 1,
            PixelFormat::Mono16 | PixelFormat::Bayer16 => 2,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// Axis-aligned pixel rectangle, inclusive of `x1`/`y1`, exclusive of `x2`/`y2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }
}

/// Packed pixel buffer. 16-bit samples are little-endian.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            bail!(
                "image buffer is {} bytes, expected {} for {}x{} {:?}",
                data.len(),
                expected,
                width,
                height,
                format
            );
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn zeroed(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0u8; len],
        }
    }

    fn bpp(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.bpp();
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        &self.data[start..start + bpp]
    }

    pub fn rotate_180(&self) -> Image {
        let bpp = self.bpp();
        let mut data = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(bpp).rev() {
            data.extend_from_slice(px);
        }
        Image {
            data,
            ..self.clone()
        }
    }

    /// Nearest-neighbour resize.
    pub fn resize_nearest(&self, width: u32, height: u32) -> Image {
        let width = width.max(1);
        let height = height.max(1);
        let bpp = self.bpp();
        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        if self.width == 0 || self.height == 0 {
            return Image::zeroed(width, height, self.format);
        }
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as u32;
                data.extend_from_slice(self.pixel(sx, sy));
            }
        }
        Image {
            width,
            height,
            format: self.format,
            data,
        }
    }

    pub fn half_size(&self) -> Image {
        self.resize_nearest((self.width / 2).max(1), (self.height / 2).max(1))
    }

    /// Crop to `rect`, clamped to the image bounds.
    pub fn crop(&self, rect: BoundingBox) -> Image {
        let x1 = rect.x1.min(self.width);
        let y1 = rect.y1.min(self.height);
        let x2 = rect.x2.clamp(x1, self.width);
        let y2 = rect.y2.clamp(y1, self.height);
        let bpp = self.bpp();
        let mut data = Vec::with_capacity((x2 - x1) as usize * (y2 - y1) as usize * bpp);
        for y in y1..y2 {
            let row = (y as usize * self.width as usize) * bpp;
            data.extend_from_slice(&self.data[row + x1 as usize * bpp..row + x2 as usize * bpp]);
        }
        Image {
            width: x2 - x1,
            height: y2 - y1,
            format: self.format,
            data,
        }
    }

    /// Reduce 16-bit samples to their high byte. 8-bit images are returned as-is.
    pub fn to_8bit(&self) -> Image {
        let format = match self.format {
            PixelFormat::Mono16 => PixelFormat::Mono8,
            PixelFormat::Bayer16 => PixelFormat::Bayer8,
            _ => return self.clone(),
        };
        let data = self.data.chunks_exact(2).map(|s| s[1]).collect();
        Image {
            width: self.width,
            height: self.height,
            format,
            data,
        }
    }

    /// Side-by-side strip of square thumbnails, one per rectangle.
    ///
    /// Each thumbnail is the smallest square around the rectangle's centre
    /// that contains it, scaled to `size` pixels.
    pub fn composite_thumbnail(&self, rects: &[BoundingBox], size: u32) -> Image {
        let size = size.max(1);
        let count = rects.len().max(1) as u32;
        let mut strip = Image::zeroed(size * count, size, self.format);
        let bpp = self.bpp();
        for (i, rect) in rects.iter().enumerate() {
            let side = rect.width().max(rect.height()).max(1);
            let (cx, cy) = rect.center();
            let half = side as f64 / 2.0;
            let x1 = (cx - half).max(0.0) as u32;
            let y1 = (cy - half).max(0.0) as u32;
            let square = self
                .crop(BoundingBox {
                    x1,
                    y1,
                    x2: x1 + side,
                    y2: y1 + side,
                })
                .resize_nearest(size, size);
            let x_off = i as u32 * size;
            for y in 0..size {
                let src = (y as usize * size as usize) * bpp;
                let dst = (y as usize * strip.width as usize + x_off as usize) * bpp;
                let len = size as usize * bpp;
                strip.data[dst..dst + len].copy_from_slice(&square.data[src..src + len]);
            }
        }
        strip
    }
}

/// Where a frame's pixels live.
#[derive(Clone, Debug)]
pub enum FrameData {
    /// Captured file on disk, decoded lazily by the consuming stage.
    File(PathBuf),
    Pixels(Image),
}

/// One captured unit moving through the pipeline.
#[derive(Clone, Debug)]
pub struct Frame {
    pub capture_timestamp: Timestamp,
    pub sequence: u64,
    pub data: FrameData,
}

impl Frame {
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            FrameData::File(path) => Some(path),
            FrameData::Pixels(_) => None,
        }
    }
}

fn frame_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{14})(\d{2})?(Z)?$").unwrap_or_else(|e| panic!("frame time regex: {e}"))
    })
}

/// Parse the capture time embedded in a frame file name.
///
/// Accepts `<prefix>YYYYmmddHHMMSS[hh][Z]` at the end of the stem; a
/// trailing `Z` marks UTC, otherwise the digits are local time.
pub fn parse_frame_time(path: &Path) -> Result<Timestamp> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("no file name in {}", path.display()))?;
    let caps = frame_time_regex()
        .captures(stem)
        .ok_or_else(|| anyhow!("no timestamp in {}", stem))?;
    let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y%m%d%H%M%S")
        .map_err(|e| anyhow!("bad timestamp in {}: {}", stem, e))?;
    let hundredths: f64 = caps
        .get(2)
        .map(|m| m.as_str().parse::<f64>())
        .transpose()?
        .unwrap_or(0.0);
    let seconds = if caps.get(3).is_some() {
        naive.and_utc().timestamp()
    } else {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| anyhow!("non-existent local time in {}", stem))?
            .timestamp()
    };
    Ok(seconds as f64 + hundredths / 100.0)
}

/// UTC file-name label with 0.01 s resolution, e.g. `2024061512301542Z`.
pub fn frame_time_label(t: Timestamp) -> String {
    let total = (t * 100.0).round() as i64;
    let secs = total.div_euclid(100);
    let hundredths = total.rem_euclid(100);
    let dt = DateTime::from_timestamp(secs, 0).unwrap_or_default();
    format!("{}{:02}Z", dt.format("%Y%m%d%H%M%S"), hundredths)
}

/// Bounded map from frame timestamp to the captured file.
///
/// Oldest entries are evicted first once `capacity` is reached.
pub struct ImageIndex {
    inner: Mutex<IndexInner>,
    capacity: usize,
}

struct IndexInner {
    paths: HashMap<u64, PathBuf>,
    order: VecDeque<u64>,
}

impl ImageIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                paths: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, t: Timestamp, path: PathBuf) {
        let key = timestamp_key(t);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.paths.insert(key, path).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.paths.remove(&old);
            }
        }
    }

    pub fn lookup(&self, t: Timestamp) -> Option<PathBuf> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.paths.get(&timestamp_key(t)).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
