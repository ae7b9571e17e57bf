// src/hough.rs
//
// Progressive probabilistic Hough transform over a binary edge map.
//
// Each edge pixel votes into a (theta, rho) accumulator. As soon as a bin
// reaches the threshold, the corresponding line is walked in both directions
// from the voting pixel, tolerating up to `max_line_gap` missing pixels. The
// walked pixels are removed from the map (and their votes withdrawn), so a
// marking produces one segment rather than many.
//
// Pixels are visited in raster order, which keeps the output deterministic.
// With the `opencv` feature the extractor uses `OpenCvHough` instead, which
// hands the same parameters to `imgproc::hough_lines_p`.

use crate::lane_detection::SegmentDetector;
use crate::types::{HoughConfig, LineSegment};
use anyhow::Result;
use image::GrayImage;
use std::f32::consts::PI;

#[derive(Debug, Clone)]
pub struct ProbabilisticHough {
    pub rho: f32,
    pub theta: f32,
    pub threshold: u32,
    pub min_line_length: f32,
    pub max_line_gap: f32,
}

impl ProbabilisticHough {
    pub fn from_config(config: &HoughConfig) -> Self {
        Self {
            rho: config.rho,
            theta: config.theta_deg.to_radians(),
            threshold: config.threshold,
            min_line_length: config.min_line_length,
            max_line_gap: config.max_line_gap,
        }
    }
}

struct Accumulator {
    num_rho: usize,
    // (cos, sin) per angle bin, pre-divided by rho
    trig: Vec<(f32, f32)>,
    votes: Vec<i32>,
}

impl Accumulator {
    fn new(width: u32, height: u32, rho: f32, theta: f32) -> Self {
        let num_angle = ((PI / theta).round() as usize).max(1);
        let num_rho = ((((width + height) * 2 + 1) as f32 / rho).round() as usize).max(1);
        let irho = 1.0 / rho;
        let trig = (0..num_angle)
            .map(|n| {
                let angle = n as f32 * theta;
                (angle.cos() * irho, angle.sin() * irho)
            })
            .collect();

        Self {
            num_rho,
            trig,
            votes: vec![0; num_angle * num_rho],
        }
    }

    fn bin(&self, n: usize, x: i32, y: i32) -> usize {
        let (c, s) = self.trig[n];
        let r = (x as f32 * c + y as f32 * s).round() as i64 + ((self.num_rho as i64 - 1) / 2);
        n * self.num_rho + r.clamp(0, self.num_rho as i64 - 1) as usize
    }

    /// Vote for every line through (x, y); returns the strongest bin.
    fn vote(&mut self, x: i32, y: i32) -> (usize, i32) {
        let mut best = (0, i32::MIN);
        for n in 0..self.trig.len() {
            let idx = self.bin(n, x, y);
            self.votes[idx] += 1;
            if self.votes[idx] > best.1 {
                best = (n, self.votes[idx]);
            }
        }
        best
    }

    fn withdraw(&mut self, x: i32, y: i32) {
        for n in 0..self.trig.len() {
            let idx = self.bin(n, x, y);
            self.votes[idx] -= 1;
        }
    }
}

impl SegmentDetector for ProbabilisticHough {
    fn detect(&self, edges: &GrayImage) -> Result<Vec<LineSegment>> {
        let (width, height) = edges.dimensions();
        if width == 0 || height == 0 || self.rho <= 0.0 || self.theta <= 0.0 {
            return Ok(Vec::new());
        }

        let w = width as i32;
        let h = height as i32;
        let index = |x: i32, y: i32| (y * w + x) as usize;

        let mut mask: Vec<bool> = edges.pixels().map(|p| p.0[0] != 0).collect();
        let mut voted = vec![false; mask.len()];
        let points: Vec<(i32, i32)> = edges
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] != 0)
            .map(|(x, y, _)| (x as i32, y as i32))
            .collect();

        let mut accum = Accumulator::new(width, height, self.rho, self.theta);
        let mut segments = Vec::new();

        for &(px, py) in &points {
            // Already consumed by an earlier line
            if !mask[index(px, py)] {
                continue;
            }

            let (best_n, best_votes) = accum.vote(px, py);
            voted[index(px, py)] = true;
            if best_votes < self.threshold as i32 {
                continue;
            }

            // Unit step along the line, major axis first
            let angle = best_n as f32 * self.theta;
            let (a, b) = (-angle.sin(), angle.cos());
            let (step_x, step_y) = if a.abs() > b.abs() {
                (a.signum(), b / a.abs())
            } else {
                (a / b.abs(), b.signum())
            };

            let walk = |dir: f32, mask: &[bool]| -> (i32, i32) {
                let mut end = (px, py);
                let mut gap = 0.0f32;
                let mut fx = px as f32 + 0.5;
                let mut fy = py as f32 + 0.5;
                loop {
                    let x = fx.floor() as i32;
                    let y = fy.floor() as i32;
                    if x < 0 || x >= w || y < 0 || y >= h {
                        break;
                    }
                    if mask[index(x, y)] {
                        gap = 0.0;
                        end = (x, y);
                    } else {
                        gap += 1.0;
                        if gap > self.max_line_gap {
                            break;
                        }
                    }
                    fx += step_x * dir;
                    fy += step_y * dir;
                }
                end
            };

            let end_fwd = walk(1.0, &mask);
            let end_back = walk(-1.0, &mask);

            let good_line = ((end_fwd.0 - end_back.0).abs() as f32) >= self.min_line_length
                || ((end_fwd.1 - end_back.1).abs() as f32) >= self.min_line_length;

            // Clear the walked pixels up to each end point
            for (dir, end) in [(1.0f32, end_fwd), (-1.0f32, end_back)] {
                let mut fx = px as f32 + 0.5;
                let mut fy = py as f32 + 0.5;
                loop {
                    let x = fx.floor() as i32;
                    let y = fy.floor() as i32;
                    if x < 0 || x >= w || y < 0 || y >= h {
                        break;
                    }
                    let idx = index(x, y);
                    if mask[idx] {
                        if good_line && voted[idx] {
                            accum.withdraw(x, y);
                            voted[idx] = false;
                        }
                        mask[idx] = false;
                    }
                    if (x, y) == end {
                        break;
                    }
                    fx += step_x * dir;
                    fy += step_y * dir;
                }
            }

            if good_line {
                segments.push(LineSegment::new(end_fwd.0, end_fwd.1, end_back.0, end_back.1));
            }
        }

        Ok(segments)
    }
}

#[cfg(feature = "opencv")]
#[derive(Debug, Clone)]
pub struct OpenCvHough {
    pub rho: f64,
    pub theta: f64,
    pub threshold: i32,
    pub min_line_length: f64,
    pub max_line_gap: f64,
}

#[cfg(feature = "opencv")]
impl OpenCvHough {
    pub fn from_config(config: &HoughConfig) -> Self {
        Self {
            rho: config.rho as f64,
            theta: (config.theta_deg as f64).to_radians(),
            threshold: config.threshold as i32,
            min_line_length: config.min_line_length as f64,
            max_line_gap: config.max_line_gap as f64,
        }
    }
}

#[cfg(feature = "opencv")]
impl SegmentDetector for OpenCvHough {
    fn detect(&self, edges: &GrayImage) -> Result<Vec<LineSegment>> {
        use opencv::{
            core::{Vec4i, Vector},
            imgproc,
        };

        if edges.width() == 0 || edges.height() == 0 {
            return Ok(Vec::new());
        }

        let src = crate::lane_detection::cv::gray_to_mat(edges)?;
        let mut lines = Vector::<Vec4i>::new();
        imgproc::hough_lines_p(
            &src,
            &mut lines,
            self.rho,
            self.theta,
            self.threshold,
            self.min_line_length,
            self.max_line_gap,
        )?;

        Ok(lines
            .iter()
            .map(|l| LineSegment::new(l[0], l[1], l[2], l[3]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn detector() -> ProbabilisticHough {
        ProbabilisticHough {
            rho: 1.0,
            theta: 1.0f32.to_radians(),
            threshold: 10,
            min_line_length: 10.0,
            max_line_gap: 5.0,
        }
    }

    #[test]
    fn test_empty_map_has_no_segments() {
        let edges = GrayImage::new(64, 64);
        assert!(detector().detect(&edges).unwrap().is_empty());
    }

    #[test]
    fn test_vertical_line_found_once() {
        let mut edges = GrayImage::new(64, 80);
        for y in 10..70 {
            edges.put_pixel(30, y, Luma([255]));
        }
        let segments = detector().detect(&edges).unwrap();
        assert_eq!(segments.len(), 1);

        let s = segments[0];
        assert_eq!((s.x1, s.x2), (30, 30));
        assert_eq!(s.y1.min(s.y2), 10);
        assert_eq!(s.y1.max(s.y2), 69);
    }

    #[test]
    fn test_sparse_noise_below_threshold() {
        let mut edges = GrayImage::new(64, 64);
        for (x, y) in [(3, 7), (40, 12), (22, 50), (60, 60), (10, 33)] {
            edges.put_pixel(x, y, Luma([255]));
        }
        assert!(detector().detect(&edges).unwrap().is_empty());
    }

    #[test]
    fn test_short_run_rejected_by_min_length() {
        let mut edges = GrayImage::new(64, 64);
        for y in 20..32 {
            edges.put_pixel(12, y, Luma([255]));
        }
        let mut hough = detector();
        hough.min_line_length = 20.0;
        assert!(hough.detect(&edges).unwrap().is_empty());
    }

    #[cfg(feature = "opencv")]
    #[test]
    fn test_opencv_hough_finds_vertical_line() {
        let mut edges = GrayImage::new(64, 80);
        for y in 10..70 {
            edges.put_pixel(30, y, Luma([255]));
        }
        let hough = OpenCvHough::from_config(&HoughConfig {
            threshold: 10,
            min_line_length: 10.0,
            max_line_gap: 5.0,
            ..HoughConfig::default()
        });
        let segments = hough.detect(&edges).unwrap();
        assert!(!segments.is_empty());
        assert!(segments.iter().all(|s| s.x1 == 30 && s.x2 == 30));
    }
}
