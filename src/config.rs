// src/config.rs

use crate::error::ConfigError;
use crate::types::{BackendKind, Config};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path))?;
        Ok(config)
    }

    /// Reject thresholds and limits the pipeline cannot run with. Paths are
    /// checked separately by [`Config::check_paths`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let det = &self.detection;
        if !(det.iou_threshold > 0.0 && det.iou_threshold <= 1.0) {
            return Err(ConfigError::IouThreshold(det.iou_threshold));
        }
        if !(0.0..=1.0).contains(&det.score_threshold) {
            return Err(ConfigError::ScoreThreshold(det.score_threshold));
        }
        if det.max_output_size_per_class == 0 {
            return Err(ConfigError::ZeroLimit("max_output_size_per_class"));
        }
        if det.max_total_size == 0 {
            return Err(ConfigError::ZeroLimit("max_total_size"));
        }
        if self.model.input_size == 0 {
            return Err(ConfigError::ZeroLimit("input_size"));
        }

        let lanes = &self.lanes;
        if lanes.roi.len() < 3 {
            return Err(ConfigError::RoiTooSmall(lanes.roi.len()));
        }
        if !(lanes.min_angle_deg >= 0.0
            && lanes.min_angle_deg < lanes.max_angle_deg
            && lanes.max_angle_deg <= 90.0)
        {
            return Err(ConfigError::AngleBand {
                min: lanes.min_angle_deg,
                max: lanes.max_angle_deg,
            });
        }
        if !(lanes.canny_low >= 0.0 && lanes.canny_low <= lanes.canny_high) {
            return Err(ConfigError::Invalid {
                field: "canny thresholds",
                reason: format!(
                    "need 0 <= low <= high, got {} / {}",
                    lanes.canny_low, lanes.canny_high
                ),
            });
        }
        if lanes.hough.rho <= 0.0 || lanes.hough.theta_deg <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "hough resolution",
                reason: "rho and theta must be positive".to_string(),
            });
        }
        if lanes.hough.threshold == 0 {
            return Err(ConfigError::ZeroLimit("hough.threshold"));
        }
        if lanes.stroke_width == 0 {
            return Err(ConfigError::ZeroLimit("stroke_width"));
        }

        let blend = &self.compositor;
        if blend.frame_weight < 0.0 || blend.overlay_weight < 0.0 {
            return Err(ConfigError::Invalid {
                field: "blend weights",
                reason: "weights must be non-negative".to_string(),
            });
        }

        if self.video.output_format.chars().count() != 4 {
            return Err(ConfigError::Invalid {
                field: "output_format",
                reason: format!("fourcc must be 4 characters, got {:?}", self.video.output_format),
            });
        }

        Ok(())
    }

    /// Fail fast on inputs that cannot be opened.
    pub fn check_paths(&self) -> Result<(), ConfigError> {
        if !Path::new(&self.video.source).exists() {
            return Err(ConfigError::MissingPath(self.video.source.clone()));
        }
        if self.model.backend == BackendKind::Onnx && !Path::new(&self.model.weights).exists() {
            return Err(ConfigError::MissingPath(self.model.weights.clone()));
        }
        if let Some(names) = &self.model.class_names {
            if !Path::new(names).exists() {
                return Err(ConfigError::MissingPath(names.clone()));
            }
        }
        Ok(())
    }
}
