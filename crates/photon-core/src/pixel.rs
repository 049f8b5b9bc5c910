//! Frame extent and pixel format.
//!
//! A frame is a row-major array of [`PackedRgba`] values with no row padding.
//! Each pixel packs red into the lowest byte, so the in-memory byte order on a
//! little-endian host is `R, G, B, A`, the same layout `packUnorm4x8` writes.

use bytemuck::{Pod, Zeroable};

use crate::constants::{BYTES_PER_PIXEL, WORKGROUP_SIZE};
use crate::error::{Error, Result};

/// One pixel of a rendered frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct PackedRgba(pub u32);

impl PackedRgba {
    /// Opaque black.
    pub const BLACK: Self = Self::from_rgba(0, 0, 0, 255);

    /// Pack four 8-bit channels.
    #[inline]
    pub const fn from_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self(u32::from_le_bytes([r, g, b, a]))
    }

    /// Pack an opaque color.
    #[inline]
    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self::from_rgba(r, g, b, 255)
    }

    /// Unpack into `[r, g, b, a]`.
    #[inline]
    pub const fn to_rgba(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Unpack into `[r, g, b]`, dropping alpha.
    #[inline]
    pub const fn to_rgb(self) -> [u8; 3] {
        let [r, g, b, _] = self.to_rgba();
        [r, g, b]
    }
}

/// Size of a rendered frame in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameExtent {
    pub width: u32,
    pub height: u32,
}

impl FrameExtent {
    /// Create a new extent. Both dimensions must be non-zero.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidData(format!(
                "frame extent must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// Number of pixels in the frame.
    pub const fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size of the packed pixel buffer in bytes.
    pub const fn byte_size(&self) -> u64 {
        self.pixel_count() * BYTES_PER_PIXEL
    }

    /// Compute dispatch grid: `ceil(w / 32) x ceil(h / 32) x 1`.
    pub const fn dispatch_groups(&self) -> [u32; 3] {
        [
            self.width.div_ceil(WORKGROUP_SIZE),
            self.height.div_ceil(WORKGROUP_SIZE),
            1,
        ]
    }

    /// Width over height.
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Reinterpret raw readback bytes as packed pixels.
///
/// The byte count must match the extent exactly.
pub fn pixels_from_bytes(extent: FrameExtent, bytes: &[u8]) -> Result<Vec<PackedRgba>> {
    if bytes.len() as u64 != extent.byte_size() {
        return Err(Error::OutOfBounds(format!(
            "expected {} bytes for {}x{} frame, got {}",
            extent.byte_size(),
            extent.width,
            extent.height,
            bytes.len()
        )));
    }

    // Readback memory carries no alignment guarantee for u32 views.
    Ok(bytes
        .chunks_exact(BYTES_PER_PIXEL as usize)
        .map(|c| PackedRgba(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_places_red_in_low_byte() {
        let p = PackedRgba::from_rgba(0x11, 0x22, 0x33, 0x44);
        assert_eq!(p.0, 0x4433_2211);
        assert_eq!(p.to_rgba(), [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(p.to_rgb(), [0x11, 0x22, 0x33]);
    }

    #[test]
    fn opaque_constructor_sets_alpha() {
        assert_eq!(PackedRgba::from_rgb(1, 2, 3).to_rgba()[3], 255);
        assert_eq!(PackedRgba::BLACK.to_rgba(), [0, 0, 0, 255]);
    }

    #[test]
    fn dispatch_rounds_up() {
        let extent = FrameExtent::new(1280, 721).unwrap();
        assert_eq!(extent.dispatch_groups(), [40, 23, 1]);

        let tiny = FrameExtent::new(1, 1).unwrap();
        assert_eq!(tiny.dispatch_groups(), [1, 1, 1]);
    }

    #[test]
    fn zero_extent_rejected() {
        assert!(FrameExtent::new(0, 10).is_err());
        assert!(FrameExtent::new(10, 0).is_err());
    }

    #[test]
    fn byte_size_is_four_per_pixel() {
        let extent = FrameExtent::new(3, 2).unwrap();
        assert_eq!(extent.pixel_count(), 6);
        assert_eq!(extent.byte_size(), 24);
    }

    #[test]
    fn pixels_from_bytes_checks_length() {
        let extent = FrameExtent::new(2, 1).unwrap();
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let pixels = pixels_from_bytes(extent, &bytes).unwrap();
        assert_eq!(pixels[0].to_rgba(), [1, 2, 3, 4]);
        assert_eq!(pixels[1].to_rgba(), [5, 6, 7, 8]);

        assert!(pixels_from_bytes(extent, &bytes[..7]).is_err());
    }
}
