//! Image decode/encode collaborator.
//!
//! The pipeline never touches file formats directly; it goes through an
//! `ImageCodec`. The `codec-image` feature provides one backed by the
//! `image` crate.

use anyhow::Result;
use std::path::Path;

use crate::frame::Image;

#[cfg(feature = "codec-image")]
mod image_rs;

#[cfg(feature = "codec-image")]
pub use image_rs::ImageCrateCodec;

/// JPEG quality used for thumbnails.
pub const THUMBNAIL_QUALITY: u8 = 90;

pub trait ImageCodec: Send + Sync {
    /// Read and decode an image file.
    fn decode_file(&self, path: &Path) -> Result<Image>;

    /// Encode as JPEG at `quality` (1..=100). 16-bit input is reduced to 8 bits.
    fn encode_jpeg(&self, image: &Image, quality: u8) -> Result<Vec<u8>>;

    /// Encode as binary PGM/PPM, keeping 16-bit depth.
    fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>>;
}

/// Default codec for this build, if one is compiled in.
pub fn default_codec() -> Option<std::sync::Arc<dyn ImageCodec>> {
    #[cfg(feature = "codec-image")]
    {
        Some(std::sync::Arc::new(ImageCrateCodec))
    }
    #[cfg(not(feature = "codec-image"))]
    {
        None
    }
}
