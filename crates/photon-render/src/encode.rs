//! Frame file output.
//!
//! Encoders take packed RGBA pixels and write RGB; alpha is dropped on the
//! way out and comes back as 255 when a file is read.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::{ExtendedColorType, ImageEncoder as _};
use photon_core::{FrameExtent, PackedRgba};
use thiserror::Error;
use tracing::info;

/// Errors from writing or reading frame files.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Expected {expected} pixels for the frame, got {actual}")]
    SizeMismatch { expected: u64, actual: usize },

    #[error("No encoder for output path '{0}' (use .png or .ppm)")]
    UnsupportedFormat(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] photon_core::Error),
}

/// Writes a rendered frame to a file.
pub trait ImageEncoder {
    /// Encode `pixels` (row-major, no padding) into `path`.
    fn encode(
        &self,
        path: &Path,
        pixels: &[PackedRgba],
        width: u32,
        height: u32,
    ) -> Result<(), EncodeError>;
}

/// PNG output, 8-bit RGB.
#[derive(Clone, Copy, Debug, Default)]
pub struct PngWriter;

/// Binary PPM (P6) output.
#[derive(Clone, Copy, Debug, Default)]
pub struct PpmWriter;

impl ImageEncoder for PngWriter {
    fn encode(
        &self,
        path: &Path,
        pixels: &[PackedRgba],
        width: u32,
        height: u32,
    ) -> Result<(), EncodeError> {
        let rgb = to_rgb_bytes(pixels, width, height)?;
        let writer = BufWriter::new(File::create(path)?);
        PngEncoder::new(writer).write_image(&rgb, width, height, ExtendedColorType::Rgb8)?;
        info!("Frame saved: {}", path.display());
        Ok(())
    }
}

impl ImageEncoder for PpmWriter {
    fn encode(
        &self,
        path: &Path,
        pixels: &[PackedRgba],
        width: u32,
        height: u32,
    ) -> Result<(), EncodeError> {
        let rgb = to_rgb_bytes(pixels, width, height)?;
        let writer = BufWriter::new(File::create(path)?);
        PnmEncoder::new(writer)
            .with_subtype(PnmSubtype::Pixmap(SampleEncoding::Binary))
            .write_image(&rgb, width, height, ExtendedColorType::Rgb8)?;
        info!("Frame saved: {}", path.display());
        Ok(())
    }
}

/// Pick an encoder from the output path's extension.
pub fn encoder_for_path(path: &Path) -> Result<Box<dyn ImageEncoder>, EncodeError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => Ok(Box::new(PngWriter)),
        Some("ppm" | "pnm") => Ok(Box::new(PpmWriter)),
        _ => Err(EncodeError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Read a frame file back into packed pixels (alpha 255).
pub fn read_frame(path: &Path) -> Result<(FrameExtent, Vec<PackedRgba>), EncodeError> {
    let rgb = image::open(path)?.to_rgb8();
    let extent = FrameExtent::new(rgb.width(), rgb.height())?;
    let pixels = rgb
        .pixels()
        .map(|p| PackedRgba::from_rgb(p.0[0], p.0[1], p.0[2]))
        .collect();
    Ok((extent, pixels))
}

fn to_rgb_bytes(pixels: &[PackedRgba], width: u32, height: u32) -> Result<Vec<u8>, EncodeError> {
    let expected = u64::from(width) * u64::from(height);
    if pixels.len() as u64 != expected {
        return Err(EncodeError::SizeMismatch {
            expected,
            actual: pixels.len(),
        });
    }
    Ok(pixels.iter().flat_map(|p| p.to_rgb()).collect())
}
