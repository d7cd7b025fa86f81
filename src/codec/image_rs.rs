use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageBuffer, ImageFormat};
use std::io::Cursor;
use std::path::Path;

use super::ImageCodec;
use crate::frame::{Image, PixelFormat};

/// `ImageCodec` on top of the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageCrateCodec;

impl ImageCodec for ImageCrateCodec {
    fn decode_file(&self, path: &Path) -> Result<Image> {
        let decoded =
            image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
        let (width, height) = (decoded.width(), decoded.height());
        match decoded {
            DynamicImage::ImageLuma8(buf) => {
                Image::new(width, height, PixelFormat::Mono8, buf.into_raw())
            }
            DynamicImage::ImageLuma16(buf) => {
                let data = buf
                    .into_raw()
                    .into_iter()
                    .flat_map(|s| s.to_le_bytes())
                    .collect();
                Image::new(width, height, PixelFormat::Mono16, data)
            }
            other => Image::new(width, height, PixelFormat::Rgb8, other.to_rgb8().into_raw()),
        }
    }

    fn encode_jpeg(&self, image: &Image, quality: u8) -> Result<Vec<u8>> {
        let image = image.to_8bit();
        let color = match image.format {
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
            _ => ExtendedColorType::L8,
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&image.data, image.width, image.height, color)
            .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
        Ok(out)
    }

    fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>> {
        let size_err = || anyhow!("{}x{} buffer does not match its size", image.width, image.height);
        let dynamic = match image.format {
            PixelFormat::Rgb8 => DynamicImage::ImageRgb8(
                ImageBuffer::from_raw(image.width, image.height, image.data.clone())
                    .ok_or_else(size_err)?,
            ),
            PixelFormat::Mono8 | PixelFormat::Bayer8 => DynamicImage::ImageLuma8(
                ImageBuffer::from_raw(image.width, image.height, image.data.clone())
                    .ok_or_else(size_err)?,
            ),
            PixelFormat::Mono16 | PixelFormat::Bayer16 => {
                let samples: Vec<u16> = image
                    .data
                    .chunks_exact(2)
                    .map(|s| u16::from_le_bytes([s[0], s[1]]))
                    .collect();
                DynamicImage::ImageLuma16(
                    ImageBuffer::from_raw(image.width, image.height, samples)
                        .ok_or_else(size_err)?,
                )
            }
        };
        let mut out = Cursor::new(Vec::new());
        dynamic
            .write_to(&mut out, ImageFormat::Pnm)
            .map_err(|e| anyhow!("pnm encode failed: {}", e))?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_round_trips_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::zeroed(32, 16, PixelFormat::Mono8);
        let jpeg = ImageCrateCodec.encode_jpeg(&image, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, &jpeg).unwrap();
        let decoded = ImageCrateCodec.decode_file(&path).unwrap();
        assert_eq!((decoded.width, decoded.height), (32, 16));
    }

    #[test]
    fn pgm_keeps_sixteen_bit_depth() {
        let dir = tempfile::tempdir().unwrap();
        let data = (0..16u16).flat_map(|v| (v * 1000).to_le_bytes()).collect();
        let image = Image::new(4, 4, PixelFormat::Mono16, data).unwrap();
        let pgm = ImageCrateCodec.encode_pnm(&image).unwrap();
        assert!(pgm.starts_with(b"P5"));
        let path = dir.path().join("frame.pgm");
        std::fs::write(&path, &pgm).unwrap();
        let decoded = ImageCrateCodec.decode_file(&path).unwrap();
        assert_eq!(decoded.format, PixelFormat::Mono16);
        assert_eq!(decoded.data, image.data);
    }
}
