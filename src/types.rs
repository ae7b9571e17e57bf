use image::{RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub lanes: LaneConfig,
    pub compositor: CompositorConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

/// Which inference collaborator runs the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ONNX Runtime session (requires the `onnx` feature).
    Onnx,
    /// No detector; every frame decodes to an empty detection set.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Yolov3,
    Yolov4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: BackendKind,
    pub weights: String,
    pub input_size: u32,
    pub variant: ModelVariant,
    pub tiny: bool,
    /// Exported graphs either fuse boxes and scores into one tensor or emit
    /// them separately.
    pub fused_output: bool,
    pub class_names: Option<String>,
    pub num_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Onnx,
            weights: "./checkpoints/yolov4-416.onnx".to_string(),
            input_size: 416,
            variant: ModelVariant::Yolov4,
            tiny: false,
            fused_output: true,
            class_names: None,
            num_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub iou_threshold: f32,
    pub score_threshold: f32,
    pub max_output_size_per_class: usize,
    pub max_total_size: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.45,
            score_threshold: 0.50,
            max_output_size_per_class: 50,
            max_total_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Region of interest polygon in frame pixels, clockwise or not.
    pub roi: Vec<[i32; 2]>,
    pub canny_low: f32,
    pub canny_high: f32,
    pub hough: HoughConfig,
    pub min_angle_deg: f64,
    pub max_angle_deg: f64,
    pub stroke_width: u32,
    pub color: [u8; 3],
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            roi: vec![[586, 531], [930, 531], [1100, 765], [150, 765]],
            canny_low: 100.0,
            canny_high: 300.0,
            hough: HoughConfig::default(),
            min_angle_deg: 35.0,
            max_angle_deg: 85.0,
            stroke_width: 10,
            color: [0, 255, 0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoughConfig {
    /// Distance resolution of the accumulator in pixels.
    pub rho: f32,
    /// Angle resolution of the accumulator in degrees.
    pub theta_deg: f32,
    pub threshold: u32,
    pub min_line_length: f32,
    pub max_line_gap: f32,
}

impl Default for HoughConfig {
    fn default() -> Self {
        Self {
            rho: 1.0,
            theta_deg: 1.0,
            threshold: 25,
            min_line_length: 4.0,
            max_line_gap: 750.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub frame_weight: f32,
    pub overlay_weight: f32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            frame_weight: 0.8,
            overlay_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub source: String,
    pub output: Option<String>,
    pub output_format: String,
    pub display: bool,
    /// Treat an unreadable frame as end-of-stream once the container's
    /// declared frame count has been reached; fail before that.
    pub trust_frame_count: bool,
    pub summary_json: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: "./data/road.mp4".to_string(),
            output: None,
            output_format: "XVID".to_string(),
            display: true,
            trust_frame_count: true,
            summary_json: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub image: RgbImage,
}

/// Axis-aligned box in normalized `[0, 1]` coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub y_min: f32,
    pub x_min: f32,
    pub y_max: f32,
    pub x_max: f32,
}

impl BoundingBox {
    pub fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Self {
        Self {
            y_min,
            x_min,
            y_max,
            x_max,
        }
    }

    pub fn clipped(&self) -> Self {
        Self {
            y_min: self.y_min.clamp(0.0, 1.0),
            x_min: self.x_min.clamp(0.0, 1.0),
            y_max: self.y_max.clamp(0.0, 1.0),
            x_max: self.x_max.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub score: f32,
}

/// Fixed-capacity NMS output. Only the first `valid_count` entries mean
/// anything; the rest are zeroed padding.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSet {
    pub entries: Vec<Detection>,
    pub valid_count: usize,
}

impl DetectionSet {
    pub fn empty(capacity: usize) -> Self {
        Self {
            entries: vec![Detection::default(); capacity],
            valid_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn valid(&self) -> &[Detection] {
        &self.entries[..self.valid_count]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSegment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl LineSegment {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedLine {
    pub segment: LineSegment,
    pub angle_deg: f64,
    pub accepted: bool,
}

/// Transparent canvas the accepted lane segments are drawn on.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub canvas: RgbaImage,
}

impl Overlay {
    pub fn is_transparent(&self) -> bool {
        self.canvas.pixels().all(|p| p.0[3] == 0)
    }
}
