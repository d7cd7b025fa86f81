//! Capture chain for frame-grabber input: Bayer decode, encode, save.
//!
//! ```text
//! input -> [bayer] -> [encode] -> [save] -> saved (optional)
//! input ------------------------> [save]            (compress off)
//! ```
//!
//! Saved files are named `i<frame_time_label>.jpg` (or `.pgm` for raw
//! frames). Each saved file is recorded in the image index and, when a
//! `saved` queue is given, handed on as a file frame.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{run_transform, spawn_stage, StageCounters, StageHandle};
use crate::codec::ImageCodec;
use crate::frame::{frame_time_label, Frame, FrameData, Image, ImageIndex, PixelFormat, Timestamp};
use crate::queue::{BoundedStageQueue, StopSignal, DEFAULT_QUEUE_CAPACITY};

/// Bayer-to-colour conversion.
pub trait Demosaic: Send {
    fn demosaic(&mut self, raw: &Image) -> Result<Image>;
}

/// Half-resolution RGGB demosaic: each 2x2 cell becomes one RGB pixel,
/// scaled back up to the source size.
#[derive(Clone, Copy, Debug, Default)]
pub struct NearestDemosaic;

impl Demosaic for NearestDemosaic {
    fn demosaic(&mut self, raw: &Image) -> Result<Image> {
        let raw = match raw.format {
            PixelFormat::Bayer8 => raw.clone(),
            PixelFormat::Bayer16 => raw.to_8bit(),
            other => bail!("cannot demosaic {:?}", other),
        };
        let (w, h) = (raw.width as usize, raw.height as usize);
        if w < 2 || h < 2 {
            bail!("bayer frame {}x{} too small", w, h);
        }
        let (cw, ch) = (w / 2, h / 2);
        let mut cells = Vec::with_capacity(cw * ch * 3);
        for cy in 0..ch {
            for cx in 0..cw {
                let at = |dx: usize, dy: usize| raw.data[(cy * 2 + dy) * w + cx * 2 + dx] as u16;
                let r = at(0, 0);
                let g = (at(1, 0) + at(0, 1)) / 2;
                let b = at(1, 1);
                cells.extend_from_slice(&[r as u8, g as u8, b as u8]);
            }
        }
        let half = Image::new(cw as u32, ch as u32, PixelFormat::Rgb8, cells)?;
        Ok(half.resize_nearest(raw.width, raw.height))
    }
}

#[derive(Clone, Debug)]
pub struct ChainOptions {
    /// Demosaic and JPEG-encode before saving; otherwise save raw PGM.
    pub compress: bool,
    /// Write files to `output_dir`. With `save` off, frames are consumed without output.
    pub save: bool,
    pub quality: u8,
    pub output_dir: PathBuf,
    pub queue_capacity: usize,
    pub poll: Duration,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            compress: true,
            save: true,
            quality: 95,
            output_dir: PathBuf::from("images"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll: Duration::from_millis(50),
        }
    }
}

/// Encoded frame on its way to disk.
struct Encoded {
    timestamp: Timestamp,
    sequence: u64,
    bytes: Vec<u8>,
    extension: &'static str,
}

pub struct CaptureChain {
    input: BoundedStageQueue<Frame>,
    handles: Vec<StageHandle>,
}

impl CaptureChain {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        opts: ChainOptions,
        demosaic: Box<dyn Demosaic>,
        codec: Arc<dyn ImageCodec>,
        index: Arc<ImageIndex>,
        saved: Option<BoundedStageQueue<Frame>>,
        counters: Arc<StageCounters>,
        stop: StopSignal,
    ) -> Result<Self> {
        if opts.save {
            std::fs::create_dir_all(&opts.output_dir).with_context(|| {
                format!("failed to create {}", opts.output_dir.display())
            })?;
        }
        let input = BoundedStageQueue::new(opts.queue_capacity);
        let to_save: BoundedStageQueue<Encoded> = BoundedStageQueue::new(opts.queue_capacity);
        let mut handles = Vec::new();

        if opts.compress {
            let to_encode: BoundedStageQueue<Frame> = BoundedStageQueue::new(opts.queue_capacity);
            handles.push(bayer_stage(
                &opts,
                demosaic,
                input.clone(),
                to_encode.clone(),
                counters.clone(),
                stop.clone(),
            )?);
            handles.push(encode_stage(
                &opts,
                codec.clone(),
                to_encode,
                to_save.clone(),
                counters.clone(),
                stop.clone(),
            )?);
        } else {
            handles.push(raw_stage(
                &opts,
                codec,
                input.clone(),
                to_save.clone(),
                counters.clone(),
                stop.clone(),
            )?);
        }
        handles.push(save_stage(&opts, to_save, index, saved, counters, stop)?);
        Ok(Self { input, handles })
    }

    /// Queue that accepts raw frames.
    pub fn input(&self) -> &BoundedStageQueue<Frame> {
        &self.input
    }

    pub fn into_handles(self) -> Vec<StageHandle> {
        self.handles
    }
}

fn pixels(frame: Frame) -> Result<(Timestamp, u64, Image)> {
    match frame.data {
        FrameData::Pixels(image) => Ok((frame.capture_timestamp, frame.sequence, image)),
        FrameData::File(path) => bail!("capture chain expects pixels, got {}", path.display()),
    }
}

fn bayer_stage(
    opts: &ChainOptions,
    mut demosaic: Box<dyn Demosaic>,
    input: BoundedStageQueue<Frame>,
    output: BoundedStageQueue<Frame>,
    counters: Arc<StageCounters>,
    stop: StopSignal,
) -> Result<StageHandle> {
    let poll = opts.poll;
    spawn_stage("bayer", move || {
        run_transform(
            "bayer",
            &input,
            Some(&output),
            &stop,
            poll,
            &counters.chain_errors,
            &counters.chain_shed,
            |frame: Frame| {
                let (t, seq, raw) = pixels(frame)?;
                let image = match raw.format {
                    PixelFormat::Bayer8 | PixelFormat::Bayer16 => demosaic.demosaic(&raw)?,
                    _ => raw,
                };
                Ok(Some(Frame {
                    capture_timestamp: t,
                    sequence: seq,
                    data: FrameData::Pixels(image),
                }))
            },
        )
    })
}

fn encode_stage(
    opts: &ChainOptions,
    codec: Arc<dyn ImageCodec>,
    input: BoundedStageQueue<Frame>,
    output: BoundedStageQueue<Encoded>,
    counters: Arc<StageCounters>,
    stop: StopSignal,
) -> Result<StageHandle> {
    let (poll, quality) = (opts.poll, opts.quality);
    spawn_stage("encode", move || {
        run_transform(
            "encode",
            &input,
            Some(&output),
            &stop,
            poll,
            &counters.chain_errors,
            &counters.chain_shed,
            |frame: Frame| {
                let (timestamp, sequence, image) = pixels(frame)?;
                Ok(Some(Encoded {
                    timestamp,
                    sequence,
                    bytes: codec.encode_jpeg(&image, quality)?,
                    extension: "jpg",
                }))
            },
        )
    })
}

fn raw_stage(
    opts: &ChainOptions,
    codec: Arc<dyn ImageCodec>,
    input: BoundedStageQueue<Frame>,
    output: BoundedStageQueue<Encoded>,
    counters: Arc<StageCounters>,
    stop: StopSignal,
) -> Result<StageHandle> {
    let poll = opts.poll;
    spawn_stage("raw", move || {
        run_transform(
            "raw",
            &input,
            Some(&output),
            &stop,
            poll,
            &counters.chain_errors,
            &counters.chain_shed,
            |frame: Frame| {
                let (timestamp, sequence, image) = pixels(frame)?;
                Ok(Some(Encoded {
                    timestamp,
                    sequence,
                    bytes: codec.encode_pnm(&image)?,
                    extension: "pgm",
                }))
            },
        )
    })
}

fn save_stage(
    opts: &ChainOptions,
    input: BoundedStageQueue<Encoded>,
    index: Arc<ImageIndex>,
    saved: Option<BoundedStageQueue<Frame>>,
    counters: Arc<StageCounters>,
    stop: StopSignal,
) -> Result<StageHandle> {
    let (poll, save, dir) = (opts.poll, opts.save, opts.output_dir.clone());
    spawn_stage("save", move || {
        run_transform(
            "save",
            &input,
            saved.as_ref(),
            &stop,
            poll,
            &counters.chain_errors,
            &counters.chain_shed,
            |encoded: Encoded| {
                if !save {
                    return Ok(None);
                }
                let name = format!("i{}.{}", frame_time_label(encoded.timestamp), encoded.extension);
                let path = dir.join(name);
                std::fs::write(&path, &encoded.bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                StageCounters::bump(&counters.saved);
                index.record(encoded.timestamp, path.clone());
                Ok(Some(Frame {
                    capture_timestamp: encoded.timestamp,
                    sequence: encoded.sequence,
                    data: FrameData::File(path),
                }))
            },
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    struct RawCodec;

    impl ImageCodec for RawCodec {
        fn decode_file(&self, path: &Path) -> Result<Image> {
            bail!("no decoder for {}", path.display())
        }

        fn encode_jpeg(&self, image: &Image, _quality: u8) -> Result<Vec<u8>> {
            Ok(image.data.clone())
        }

        fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>> {
            Ok(image.data.clone())
        }
    }

    #[test]
    fn demosaic_produces_rgb_at_source_size() {
        let raw = Image::new(4, 2, PixelFormat::Bayer8, vec![200, 100, 0, 0, 100, 50, 0, 0])
            .unwrap();
        let rgb = NearestDemosaic.demosaic(&raw).unwrap();
        assert_eq!((rgb.width, rgb.height, rgb.format), (4, 2, PixelFormat::Rgb8));
        assert_eq!(&rgb.data[..3], &[200, 100, 50]);
        assert!(NearestDemosaic
            .demosaic(&Image::zeroed(4, 4, PixelFormat::Mono8))
            .is_err());
    }

    #[test]
    fn chain_saves_named_files_and_forwards_them() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopSignal::new();
        let saved = BoundedStageQueue::new(10);
        let index = Arc::new(ImageIndex::new(10));
        let counters = Arc::new(StageCounters::default());
        let chain = CaptureChain::spawn(
            ChainOptions {
                output_dir: dir.path().to_path_buf(),
                poll: Duration::from_millis(5),
                ..ChainOptions::default()
            },
            Box::new(NearestDemosaic),
            Arc::new(RawCodec),
            index.clone(),
            Some(saved.clone()),
            counters.clone(),
            stop.clone(),
        )
        .unwrap();

        let t = 1_718_454_615.42;
        assert!(chain.input().push(Frame {
            capture_timestamp: t,
            sequence: 7,
            data: FrameData::Pixels(Image::zeroed(4, 4, PixelFormat::Bayer8)),
        }));

        let out = saved.pop_timeout(Duration::from_secs(5)).unwrap();
        let path = out.path().unwrap().to_path_buf();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("i{}.jpg", frame_time_label(t))
        );
        assert!(path.exists());
        assert_eq!(index.lookup(t), Some(path));
        assert_eq!(out.sequence, 7);

        stop.set();
        let deadline = Instant::now() + Duration::from_secs(2);
        for handle in chain.into_handles() {
            assert!(handle.join_timeout(deadline.saturating_duration_since(Instant::now())));
        }
        assert_eq!(counters.snapshot().saved, 1);
    }
}
