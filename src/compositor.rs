// src/compositor.rs
//
// Blends the lane overlay into the annotated frame.

use crate::types::{CompositorConfig, Overlay};
use anyhow::{ensure, Result};
use image::RgbImage;

/// `frame·frame_weight + overlay·overlay_weight`, rounded and saturated,
/// wherever the overlay has been painted. Transparent overlay pixels leave
/// the frame untouched, so an empty overlay is a no-op.
pub fn composite(frame: &RgbImage, overlay: &Overlay, weights: &CompositorConfig) -> Result<RgbImage> {
    ensure!(
        frame.dimensions() == overlay.canvas.dimensions(),
        "overlay is {:?} but frame is {:?}",
        overlay.canvas.dimensions(),
        frame.dimensions()
    );

    let mut output = frame.clone();
    for (out, over) in output.pixels_mut().zip(overlay.canvas.pixels()) {
        if over.0[3] == 0 {
            continue;
        }
        for c in 0..3 {
            let blended =
                out.0[c] as f32 * weights.frame_weight + over.0[c] as f32 * weights.overlay_weight;
            out.0[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }

    Ok(output)
}
