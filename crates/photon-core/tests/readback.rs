//! Readback decoding through the crate-root API.

use photon_core::{pixels_from_bytes, FrameExtent, PackedRgba};

#[test]
fn readback_bytes_decode_in_row_order() {
    let extent = FrameExtent::new(2, 1).unwrap();
    let bytes = [255, 0, 0, 255, 0, 128, 255, 255];

    let pixels = pixels_from_bytes(extent, &bytes).unwrap();

    assert_eq!(
        pixels,
        [
            PackedRgba::from_rgba(255, 0, 0, 255),
            PackedRgba::from_rgba(0, 128, 255, 255),
        ]
    );
}

#[test]
fn padded_readback_is_rejected() {
    let extent = FrameExtent::new(1, 1).unwrap();
    assert!(pixels_from_bytes(extent, &[0; 8]).is_err());
}
