// src/error.rs

use std::fmt;
use thiserror::Error;

/// Per-frame step that can abort a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Preprocess,
    Inference,
    Decode,
    LaneExtraction,
    Composite,
    Emit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::Preprocess => "preprocess",
            Stage::Inference => "inference",
            Stage::Decode => "decode",
            Stage::LaneExtraction => "lane extraction",
            Stage::Composite => "composite",
            Stage::Emit => "emit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("iou_threshold must be in (0, 1], got {0}")]
    IouThreshold(f32),
    #[error("score_threshold must be in [0, 1], got {0}")]
    ScoreThreshold(f32),
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("region of interest needs at least 3 vertices, got {0}")]
    RoiTooSmall(usize),
    #[error("angle band ({min}°, {max}°) must satisfy 0 <= min < max <= 90")]
    AngleBand { min: f64, max: f64 },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("path does not exist: {0}")]
    MissingPath(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("tensor shape mismatch: {0}")]
    ShapeMismatch(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("read stage failed at frame {frame_index}: {reason}")]
    FatalStream { frame_index: u64, reason: String },
    #[error("{stage} stage failed at frame {frame_index}: {source:#}")]
    Stage {
        stage: Stage,
        frame_index: u64,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Configuration(_) => None,
            PipelineError::FatalStream { .. } => Some(Stage::Read),
            PipelineError::Stage { stage, .. } => Some(*stage),
        }
    }
}
