use anyhow::{bail, Result};

use crate::detect::backend::{Detector, ScanParams};
use crate::detect::result::RawRegion;
use crate::frame::{BoundingBox, Image, PixelFormat};

const MIN_BLOCK: u32 = 4;
const MAX_BLOCK: u32 = 64;
const MIN_DEVIATION: f64 = 2.0;

/// Block-contrast detector.
///
/// Splits the frame into square blocks sized from the minimum region size
/// and scores each block by how far its mean brightness sits from the
/// frame's block-mean distribution. Only the rarest blocks are returned.
#[derive(Default)]
pub struct ContrastDetector {
    means: Vec<f64>,
}

impl ContrastDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Detector for ContrastDetector {
    fn name(&self) -> &'static str {
        "contrast"
    }

    fn scan(&mut self, image: &Image, params: &ScanParams) -> Result<Vec<RawRegion>> {
        if image.width == 0 || image.height == 0 {
            bail!("empty image");
        }
        let luma = luminance(image, params.blue_emphasis);
        let block = block_size(params);
        let cols = image.width.div_ceil(block);
        let rows = image.height.div_ceil(block);

        self.means.clear();
        for by in 0..rows {
            for bx in 0..cols {
                let (mut sum, mut n) = (0u64, 0u64);
                for y in by * block..((by + 1) * block).min(image.height) {
                    let row = y as usize * image.width as usize;
                    for x in bx * block..((bx + 1) * block).min(image.width) {
                        sum += luma[row + x as usize] as u64;
                        n += 1;
                    }
                }
                self.means.push(sum as f64 / n.max(1) as f64);
            }
        }

        let count = self.means.len() as f64;
        let mean = self.means.iter().sum::<f64>() / count;
        let var = self.means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / count;
        let std = var.sqrt().max(1.0);

        let mut regions: Vec<RawRegion> = self
            .means
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let deviation = (m - mean).abs() / std;
                if deviation < MIN_DEVIATION {
                    return None;
                }
                let bx = i as u32 % cols;
                let by = i as u32 / cols;
                Some(RawRegion {
                    bbox: BoundingBox {
                        x1: bx * block,
                        y1: by * block,
                        x2: ((bx + 1) * block).min(image.width),
                        y2: ((by + 1) * block).min(image.height),
                    },
                    score: deviation * 100.0,
                })
            })
            .collect();

        regions.sort_by(|a, b| b.score.total_cmp(&a.score));
        let keep = ((count * params.max_rarity_pct).ceil() as usize).max(1);
        regions.truncate(keep);
        Ok(regions)
    }
}

fn block_size(params: &ScanParams) -> u32 {
    if params.meters_per_pixel <= 0.0 {
        return MIN_BLOCK;
    }
    let px = (params.min_region_size * params.region_merge_size.max(1.0) / params.meters_per_pixel)
        .round();
    (px as u32).clamp(MIN_BLOCK, MAX_BLOCK)
}

fn luminance(image: &Image, blue_emphasis: bool) -> Vec<u8> {
    match image.format {
        PixelFormat::Mono8 | PixelFormat::Bayer8 => image.data.clone(),
        PixelFormat::Mono16 | PixelFormat::Bayer16 => image.to_8bit().data,
        PixelFormat::Rgb8 => image
            .data
            .chunks_exact(3)
            .map(|px| {
                if blue_emphasis {
                    ((px[0] as u32 + px[1] as u32 + 2 * px[2] as u32) / 4) as u8
                } else {
                    ((px[0] as u32 + px[1] as u32 + px[2] as u32) / 3) as u8
                }
            })
            .collect(),
    }
}
