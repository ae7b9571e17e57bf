// src/annotation.rs

use crate::types::DetectionSet;
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::fs;

/// Class id → display name lookup, loaded from a names file (one per line).
#[derive(Debug, Clone, Default)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read class names {}", path))?;
        Ok(Self::from_lines(&contents))
    }

    pub fn from_lines(contents: &str) -> Self {
        let names = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

/// Evenly spaced hues so neighbouring class ids stay distinguishable.
pub fn class_color(class_id: usize, num_classes: usize) -> Rgb<u8> {
    let n = num_classes.max(1);
    let hue = (class_id % n) as f32 / n as f32;
    hsv_to_rgb(hue, 1.0, 1.0)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match (i as i32).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    Rgb([
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    ])
}

/// Draw every valid detection onto a copy of `frame`. Returns the annotated
/// frame and the names of the detected classes, in score order.
pub fn draw_detections(
    frame: &RgbImage,
    detections: &DetectionSet,
    names: &ClassNames,
) -> (RgbImage, Vec<String>) {
    let mut output = frame.clone();
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return (output, Vec::new());
    }

    let num_classes = names.len().max(
        detections
            .valid()
            .iter()
            .map(|d| d.class_id + 1)
            .max()
            .unwrap_or(1),
    );
    let thickness = ((0.6 * (width + height) as f32 / 600.0) as i32).max(1);
    let mut detected = Vec::with_capacity(detections.valid_count);

    for detection in detections.valid() {
        let bbox = detection.bbox.clipped();
        let x1 = (bbox.x_min * width as f32).round() as i32;
        let y1 = (bbox.y_min * height as f32).round() as i32;
        let x2 = (bbox.x_max * width as f32).round() as i32;
        let y2 = (bbox.y_max * height as f32).round() as i32;
        let color = class_color(detection.class_id, num_classes);

        for inset in 0..thickness {
            let w = x2 - x1 - 2 * inset;
            let h = y2 - y1 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut output, rect, color);
        }

        detected.push(names.name(detection.class_id));
    }

    (output, detected)
}
