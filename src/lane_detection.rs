// src/lane_detection.rs
//
// Classical lane-segment extraction:
//
//   frame ─▶ grayscale ─▶ edges ─▶ ROI mask ─▶ segments ─▶ angle filter ─▶ overlay
//
// Only segments whose slope falls inside the configured angle band are kept.
// Near-horizontal edges (crosswalks, shadows) and near-vertical edges (poles,
// vehicle sides) fall outside it.

use crate::types::{ClassifiedLine, LaneConfig, LineSegment, Overlay};
use anyhow::Result;
use image::{imageops, GrayImage, RgbImage};
use imageproc::point::Point;
use tracing::debug;

pub trait EdgeDetector {
    /// Binary edge map (0 or 255) of a grayscale image.
    fn detect(&self, gray: &GrayImage) -> Result<GrayImage>;
}

pub trait SegmentDetector {
    fn detect(&self, edges: &GrayImage) -> Result<Vec<LineSegment>>;
}

pub struct CannyEdgeDetector {
    pub low: f32,
    pub high: f32,
}

impl EdgeDetector for CannyEdgeDetector {
    fn detect(&self, gray: &GrayImage) -> Result<GrayImage> {
        Ok(imageproc::edges::canny(gray, self.low, self.high))
    }
}

// ============================================================================
// REGION OF INTEREST
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegionOfInterest {
    vertices: Vec<Point<i32>>,
}

impl RegionOfInterest {
    pub fn new(vertices: &[[i32; 2]]) -> Self {
        let mut vertices: Vec<Point<i32>> = vertices.iter().map(|v| Point::new(v[0], v[1])).collect();
        // Polygons are implicitly closed; an explicit closing vertex is redundant
        while vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        Self { vertices }
    }

    /// Zero every pixel outside the polygon. Pixels inside or on its
    /// boundary keep their value.
    pub fn apply_mask(&self, edges: &GrayImage) -> Result<GrayImage> {
        if self.vertices.len() < 3 {
            return Ok(GrayImage::new(edges.width(), edges.height()));
        }

        #[cfg(feature = "opencv")]
        let masked = cv::mask_edges(edges, &self.vertices)?;
        #[cfg(not(feature = "opencv"))]
        let masked = self.mask_with_imageproc(edges);

        Ok(masked)
    }

    #[cfg(not(feature = "opencv"))]
    fn mask_with_imageproc(&self, edges: &GrayImage) -> GrayImage {
        use image::Luma;
        use imageproc::drawing::{draw_hollow_polygon_mut, draw_polygon_mut};

        let mut mask = GrayImage::new(edges.width(), edges.height());
        draw_polygon_mut(&mut mask, &self.vertices, Luma([255]));
        // The scanline fill can skip pixels lying exactly on slanted edges
        let outline: Vec<Point<f32>> = self
            .vertices
            .iter()
            .map(|p| Point::new(p.x as f32, p.y as f32))
            .collect();
        draw_hollow_polygon_mut(&mut mask, &outline, Luma([255]));

        let mut masked = edges.clone();
        for (out, m) in masked.pixels_mut().zip(mask.pixels()) {
            out.0[0] &= m.0[0];
        }
        masked
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Open interval of accepted absolute slope angles, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleBand {
    pub min_deg: f64,
    pub max_deg: f64,
}

impl Default for AngleBand {
    fn default() -> Self {
        Self {
            min_deg: 35.0,
            max_deg: 85.0,
        }
    }
}

/// Direction of the segment in degrees, `(-180, 180]`. Defined for every
/// segment, including vertical and zero-length ones.
pub fn segment_angle_deg(segment: &LineSegment) -> f64 {
    let dx = (segment.x2 - segment.x1) as f64;
    let dy = (segment.y2 - segment.y1) as f64;
    dy.atan2(dx).to_degrees()
}

pub fn classify_segment(segment: LineSegment, band: AngleBand) -> ClassifiedLine {
    let angle_deg = segment_angle_deg(&segment);

    // Endpoint order must not matter: fold to the line's slope angle in [0, 90]
    let mut slope = angle_deg.abs();
    if slope > 90.0 {
        slope = 180.0 - slope;
    }
    let accepted = slope > band.min_deg && slope < band.max_deg;

    ClassifiedLine {
        segment,
        angle_deg,
        accepted,
    }
}

// ============================================================================
// OVERLAY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeStyle {
    pub width: u32,
    pub color: [u8; 3],
}

/// Render the accepted lines onto a fresh transparent canvas. Rejected
/// lines are skipped.
pub fn draw_overlay(
    lines: &[ClassifiedLine],
    width: u32,
    height: u32,
    style: StrokeStyle,
) -> Result<Overlay> {
    let accepted: Vec<LineSegment> = lines.iter().filter(|l| l.accepted).map(|l| l.segment).collect();

    #[cfg(feature = "opencv")]
    let canvas = cv::draw_segments(&accepted, width, height, style)?;
    #[cfg(not(feature = "opencv"))]
    let canvas = stamp_segments(&accepted, width, height, style);

    Ok(Overlay { canvas })
}

#[cfg(not(feature = "opencv"))]
fn stamp_segments(segments: &[LineSegment], width: u32, height: u32, style: StrokeStyle) -> image::RgbaImage {
    use imageproc::drawing::draw_filled_circle_mut;

    let mut canvas = image::RgbaImage::new(width, height);
    let color = image::Rgba([style.color[0], style.color[1], style.color[2], 255]);
    let radius = (style.width / 2).max(1) as i32;

    for segment in segments {
        let dx = (segment.x2 - segment.x1) as f32;
        let dy = (segment.y2 - segment.y1) as f32;
        let steps = dx.abs().max(dy.abs()).ceil() as i32;

        for step in 0..=steps {
            let t = if steps == 0 { 0.0 } else { step as f32 / steps as f32 };
            let x = (segment.x1 as f32 + dx * t).round() as i32;
            let y = (segment.y1 as f32 + dy * t).round() as i32;
            draw_filled_circle_mut(&mut canvas, (x, y), radius, color);
        }
    }
    canvas
}

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct LaneExtraction {
    pub lines: Vec<ClassifiedLine>,
    pub overlay: Overlay,
}

impl LaneExtraction {
    pub fn accepted_count(&self) -> usize {
        self.lines.iter().filter(|l| l.accepted).count()
    }
}

pub struct LaneExtractor {
    roi: RegionOfInterest,
    edge_detector: Box<dyn EdgeDetector + Send>,
    segment_detector: Box<dyn SegmentDetector + Send>,
    band: AngleBand,
    style: StrokeStyle,
}

impl LaneExtractor {
    pub fn new(
        roi: RegionOfInterest,
        edge_detector: Box<dyn EdgeDetector + Send>,
        segment_detector: Box<dyn SegmentDetector + Send>,
        band: AngleBand,
        style: StrokeStyle,
    ) -> Self {
        Self {
            roi,
            edge_detector,
            segment_detector,
            band,
            style,
        }
    }

    pub fn from_config(config: &LaneConfig) -> Self {
        Self::new(
            RegionOfInterest::new(&config.roi),
            Box::new(CannyEdgeDetector {
                low: config.canny_low,
                high: config.canny_high,
            }),
            segment_detector(config),
            AngleBand {
                min_deg: config.min_angle_deg,
                max_deg: config.max_angle_deg,
            },
            StrokeStyle {
                width: config.stroke_width,
                color: config.color,
            },
        )
    }

    pub fn extract(&self, frame: &RgbImage) -> Result<LaneExtraction> {
        let gray = imageops::grayscale(frame);
        let edges = self.edge_detector.detect(&gray)?;
        let masked = self.roi.apply_mask(&edges)?;

        let segments = self.segment_detector.detect(&masked)?;
        let lines: Vec<ClassifiedLine> = segments
            .into_iter()
            .map(|s| classify_segment(s, self.band))
            .collect();

        let overlay = draw_overlay(&lines, frame.width(), frame.height(), self.style)?;
        let extraction = LaneExtraction { lines, overlay };

        debug!(
            "Lane segments: {} detected, {} accepted",
            extraction.lines.len(),
            extraction.accepted_count()
        );
        Ok(extraction)
    }
}

#[cfg(feature = "opencv")]
fn segment_detector(config: &LaneConfig) -> Box<dyn SegmentDetector + Send> {
    Box::new(crate::hough::OpenCvHough::from_config(&config.hough))
}

#[cfg(not(feature = "opencv"))]
fn segment_detector(config: &LaneConfig) -> Box<dyn SegmentDetector + Send> {
    Box::new(crate::hough::ProbabilisticHough::from_config(&config.hough))
}

// ============================================================================
// OPENCV
// ============================================================================

#[cfg(feature = "opencv")]
pub(crate) mod cv {
    use super::StrokeStyle;
    use crate::types::LineSegment;
    use anyhow::{Context, Result};
    use image::{GrayImage, RgbaImage};
    use imageproc::point::Point;
    use opencv::{
        core::{self, Mat, Scalar, Vector, CV_8UC1, CV_8UC4},
        imgproc,
        prelude::*,
    };

    pub(crate) fn gray_to_mat(image: &GrayImage) -> Result<Mat> {
        let mat = Mat::from_slice(image.as_raw())?;
        Ok(mat.reshape(1, image.height() as i32)?.try_clone()?)
    }

    fn mat_to_gray(mat: &Mat) -> Result<GrayImage> {
        GrayImage::from_raw(mat.cols() as u32, mat.rows() as u32, mat.data_bytes()?.to_vec())
            .context("Mask result has an unexpected layout")
    }

    pub(crate) fn mask_edges(edges: &GrayImage, vertices: &[Point<i32>]) -> Result<GrayImage> {
        let src = gray_to_mat(edges)?;
        let mut mask = Mat::zeros(src.rows(), src.cols(), CV_8UC1)?.to_mat()?;

        let mut pts_vec = Vector::<Vector<core::Point>>::new();
        pts_vec.push(Vector::from_iter(vertices.iter().map(|p| core::Point::new(p.x, p.y))));
        imgproc::fill_poly(
            &mut mask,
            &pts_vec,
            Scalar::all(255.0),
            imgproc::LINE_8,
            0,
            core::Point::new(0, 0),
        )?;

        let mut masked = Mat::default();
        core::bitwise_and(&src, &mask, &mut masked, &Mat::default())?;
        mat_to_gray(&masked)
    }

    pub(crate) fn draw_segments(
        segments: &[LineSegment],
        width: u32,
        height: u32,
        style: StrokeStyle,
    ) -> Result<RgbaImage> {
        let mut canvas = Mat::zeros(height as i32, width as i32, CV_8UC4)?.to_mat()?;
        // The canvas holds RGBA bytes, not OpenCV's BGR order
        let color = Scalar::new(
            style.color[0] as f64,
            style.color[1] as f64,
            style.color[2] as f64,
            255.0,
        );

        for s in segments {
            imgproc::line(
                &mut canvas,
                core::Point::new(s.x1, s.y1),
                core::Point::new(s.x2, s.y2),
                color,
                style.width.max(1) as i32,
                imgproc::LINE_8,
                0,
            )?;
        }

        RgbaImage::from_raw(width, height, canvas.data_bytes()?.to_vec())
            .context("Overlay canvas has an unexpected layout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, Rgba};
    use imageproc::drawing::draw_polygon_mut;

    fn edge_pixel_count(image: &GrayImage) -> usize {
        image.pixels().filter(|p| **p != Luma([0])).count()
    }

    fn seg(x1: i32, y1: i32, x2: i32, y2: i32) -> LineSegment {
        LineSegment::new(x1, y1, x2, y2)
    }

    fn quad() -> RegionOfInterest {
        RegionOfInterest::new(&[[20, 10], [60, 10], [80, 50], [0, 50]])
    }

    struct FixedSegments(Vec<LineSegment>);

    impl SegmentDetector for FixedSegments {
        fn detect(&self, _edges: &GrayImage) -> Result<Vec<LineSegment>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_steep_segment_accepted() {
        let line = classify_segment(seg(0, 0, 1, 10), AngleBand::default());
        assert!((line.angle_deg - 84.289).abs() < 0.01);
        assert!(line.accepted);
    }

    #[test]
    fn test_diagonal_segment_inside_band() {
        let line = classify_segment(seg(0, 0, 10, 10), AngleBand::default());
        assert!((line.angle_deg - 45.0).abs() < 1e-9);
        assert!(line.accepted);
    }

    #[test]
    fn test_vertical_segment_does_not_panic() {
        let line = classify_segment(seg(5, 0, 5, 40), AngleBand::default());
        assert!((line.angle_deg - 90.0).abs() < 1e-9);
        assert!(!line.accepted);

        let upward = classify_segment(seg(5, 40, 5, 0), AngleBand::default());
        assert!((upward.angle_deg + 90.0).abs() < 1e-9);
        assert!(!upward.accepted);
    }

    #[test]
    fn test_horizontal_and_zero_length_rejected() {
        let flat = classify_segment(seg(0, 7, 30, 7), AngleBand::default());
        assert_eq!(flat.angle_deg, 0.0);
        assert!(!flat.accepted);

        let point = classify_segment(seg(3, 3, 3, 3), AngleBand::default());
        assert_eq!(point.angle_deg, 0.0);
        assert!(!point.accepted);
    }

    #[test]
    fn test_negative_slopes_accepted_on_both_sides() {
        // Left lane markings rise to the right in image coordinates
        let left = classify_segment(seg(0, 100, 60, 20), AngleBand::default());
        assert!(left.angle_deg < 0.0);
        assert!(left.accepted);

        // Same line with endpoints swapped
        let swapped = classify_segment(seg(60, 20, 0, 100), AngleBand::default());
        assert!(swapped.angle_deg > 90.0);
        assert!(swapped.accepted);
    }

    /// Horizontal extent of `quad()` on row `y`, if the row crosses it.
    fn quad_span(y: f64) -> Option<(f64, f64)> {
        (10.0..=50.0)
            .contains(&y)
            .then(|| (20.0 - (y - 10.0) / 2.0, 60.0 + (y - 10.0) / 2.0))
    }

    #[test]
    fn test_mask_zeroes_outside_and_keeps_centroid() {
        let roi = quad();
        let edges = GrayImage::from_pixel(100, 60, Luma([255]));
        let masked = roi.apply_mask(&edges).unwrap();

        assert_eq!(*masked.get_pixel(40, 30), Luma([255]));

        // Above the top edge, left of the slanted side, and far right
        assert_eq!(*masked.get_pixel(40, 5), Luma([0]));
        assert_eq!(*masked.get_pixel(2, 12), Luma([0]));
        assert_eq!(*masked.get_pixel(95, 55), Luma([0]));
    }

    #[test]
    fn test_mask_keeps_boundary_pixels() {
        let roi = quad();
        let edges = GrayImage::from_pixel(100, 60, Luma([200]));
        let masked = roi.apply_mask(&edges).unwrap();
        assert_eq!(*masked.get_pixel(20, 10), Luma([200]));
        assert_eq!(*masked.get_pixel(40, 10), Luma([200]));
        assert_eq!(*masked.get_pixel(40, 50), Luma([200]));
        assert_eq!(*masked.get_pixel(10, 30), Luma([200]));
    }

    #[test]
    fn test_mask_every_outside_pixel_is_zero() {
        let roi = quad();
        let edges = GrayImage::from_pixel(100, 60, Luma([255]));
        let masked = roi.apply_mask(&edges).unwrap();

        for (x, y, p) in masked.enumerate_pixels() {
            let (x, y) = (x as f64, y as f64);
            // Rasterized edges may round by a pixel either way
            let outside = (y < 9.0 || y > 51.0)
                || [y - 1.0, y, y + 1.0]
                    .iter()
                    .all(|&row| quad_span(row).map_or(true, |(l, r)| x < l - 1.0 || x > r + 1.0));
            let inside = quad_span(y).is_some_and(|(l, r)| x > l + 1.0 && x < r - 1.0)
                && y > 11.0
                && y < 49.0;

            if outside {
                assert_eq!(*p, Luma([0]), "pixel ({}, {}) leaked", x, y);
            }
            if inside {
                assert_eq!(*p, Luma([255]), "pixel ({}, {}) dropped", x, y);
            }
        }
        assert!(edge_pixel_count(&masked) > 0);
    }

    #[test]
    fn test_mask_ignores_closing_vertex_and_degenerate_polygons() {
        let edges = GrayImage::from_pixel(100, 60, Luma([255]));

        let closed = RegionOfInterest::new(&[[20, 10], [60, 10], [80, 50], [0, 50], [20, 10]]);
        assert_eq!(closed.apply_mask(&edges).unwrap(), quad().apply_mask(&edges).unwrap());

        let line = RegionOfInterest::new(&[[0, 0], [50, 50]]);
        assert_eq!(edge_pixel_count(&line.apply_mask(&edges).unwrap()), 0);
    }

    #[test]
    fn test_overlay_transparent_without_accepted_lines() {
        let lines = vec![
            classify_segment(seg(0, 10, 50, 10), AngleBand::default()),
            classify_segment(seg(20, 0, 20, 40), AngleBand::default()),
        ];
        let overlay = draw_overlay(
            &lines,
            64,
            48,
            StrokeStyle {
                width: 10,
                color: [0, 255, 0],
            },
        )
        .unwrap();
        assert!(overlay.is_transparent());
    }

    #[test]
    fn test_overlay_draws_accepted_line() {
        let lines = vec![classify_segment(seg(10, 40, 30, 5), AngleBand::default())];
        let overlay = draw_overlay(
            &lines,
            64,
            48,
            StrokeStyle {
                width: 10,
                color: [0, 255, 0],
            },
        )
        .unwrap();
        assert!(!overlay.is_transparent());
        assert_eq!(*overlay.canvas.get_pixel(20, 22), Rgba([0, 255, 0, 255]));
        assert_eq!(overlay.canvas.get_pixel(60, 2).0[3], 0);
    }

    #[test]
    fn test_extract_uses_injected_detector() {
        let extractor = LaneExtractor::new(
            RegionOfInterest::new(&[[0, 0], [63, 0], [63, 47], [0, 47]]),
            Box::new(CannyEdgeDetector {
                low: 100.0,
                high: 300.0,
            }),
            Box::new(FixedSegments(vec![seg(10, 40, 30, 5), seg(0, 20, 60, 20)])),
            AngleBand::default(),
            StrokeStyle {
                width: 4,
                color: [0, 255, 0],
            },
        );
        let frame = RgbImage::from_pixel(64, 48, Rgb([90, 90, 90]));
        let result = extractor.extract(&frame).unwrap();
        assert_eq!(result.lines.len(), 2);
        assert_eq!(result.accepted_count(), 1);
        assert_eq!(result.overlay.canvas.dimensions(), (64, 48));
    }

    #[test]
    fn test_blank_frame_yields_no_segments() {
        let extractor = LaneExtractor::from_config(&LaneConfig {
            roi: vec![[0, 0], [63, 0], [63, 47], [0, 47]],
            ..LaneConfig::default()
        });
        let frame = RgbImage::from_pixel(64, 48, Rgb([128, 128, 128]));
        let result = extractor.extract(&frame).unwrap();
        assert!(result.lines.is_empty());
        assert!(result.overlay.is_transparent());
    }

    #[test]
    fn test_painted_lanes_are_found_and_accepted() {
        // Two thick markings converging towards the horizon, about 58 degrees each way
        let mut frame = RgbImage::new(320, 240);
        let white = Rgb([255, 255, 255]);
        let left = [(36, 230), (44, 230), (154, 54), (146, 54)];
        let right = [(276, 230), (284, 230), (174, 54), (166, 54)];
        for lane in [left, right] {
            let poly: Vec<Point<i32>> = lane.iter().map(|&(x, y)| Point::new(x, y)).collect();
            draw_polygon_mut(&mut frame, &poly, white);
        }

        let extractor = LaneExtractor::from_config(&LaneConfig {
            roi: vec![[0, 0], [319, 0], [319, 239], [0, 239]],
            ..LaneConfig::default()
        });
        let result = extractor.extract(&frame).unwrap();

        let accepted: Vec<&ClassifiedLine> = result.lines.iter().filter(|l| l.accepted).collect();
        assert!(accepted.len() >= 2, "only {} accepted", accepted.len());

        let leaning = |l: &&ClassifiedLine| {
            let s = l.segment;
            ((s.y2 - s.y1) * (s.x2 - s.x1)).signum()
        };
        assert!(accepted.iter().any(|l| leaning(l) < 0));
        assert!(accepted.iter().any(|l| leaning(l) > 0));
        assert!(!result.overlay.is_transparent());
    }
}
