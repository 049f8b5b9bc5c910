//! Core types for the Photon ray tracer.
//!
//! This crate provides the data shapes exchanged between the GPU core and
//! its collaborators:
//! - Frame extents and dispatch grid sizing
//! - The packed 32-bit RGBA pixel format
//! - Common error types

pub mod error;
pub mod pixel;

pub use error::{Error, Result};
pub use pixel::{pixels_from_bytes, FrameExtent, PackedRgba};

/// Engine-wide constants
pub mod constants {
    /// Edge length of the square compute workgroup used by the tracing shader.
    pub const WORKGROUP_SIZE: u32 = 32;
    /// Bytes per packed pixel.
    pub const BYTES_PER_PIXEL: u64 = 4;
    /// Default number of frames in flight.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
}
