// src/cli.rs

use crate::types::{BackendKind, Config, ModelVariant};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Detect objects and highlight lane markings in a road video.
#[derive(Debug, Parser)]
#[command(name = "lanewatch", version, about)]
pub struct Cli {
    /// YAML configuration; flags below override its values.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Inference backend (`none` runs lane extraction only).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Model artifact path.
    #[arg(long, value_name = "PATH")]
    pub weights: Option<String>,

    /// Square side frames are resized to before inference.
    #[arg(long, value_name = "PX")]
    pub size: Option<u32>,

    /// Tiny variant of the detector.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub tiny: bool,

    #[arg(long, value_enum)]
    pub model: Option<ModelVariant>,

    /// Video file, or a directory of PNG/JPEG frames.
    #[arg(long, value_name = "PATH")]
    pub video: Option<String>,

    #[arg(long, value_name = "THRESHOLD")]
    pub iou: Option<f32>,

    #[arg(long, value_name = "THRESHOLD")]
    pub score: Option<f32>,

    /// Output video file, or a directory to write PNG frames into.
    #[arg(long, value_name = "PATH")]
    pub output: Option<String>,

    /// Four character codec code for video output.
    #[arg(long = "output-format", value_name = "FOURCC")]
    pub output_format: Option<String>,

    /// Do not open the preview window.
    #[arg(long = "no-display", action = clap::ArgAction::SetTrue)]
    pub no_display: bool,

    /// Write the processing summary as JSON.
    #[arg(long = "summary-json", value_name = "PATH")]
    pub summary_json: Option<String>,
}

impl Cli {
    /// Base configuration (file or defaults) with flag overrides applied.
    pub fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(&path.to_string_lossy())?,
            None => Config::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut Config) {
        if let Some(backend) = self.backend {
            config.model.backend = backend;
        }
        if let Some(weights) = &self.weights {
            config.model.weights = weights.clone();
        }
        if let Some(size) = self.size {
            config.model.input_size = size;
        }
        if self.tiny {
            config.model.tiny = true;
        }
        if let Some(model) = self.model {
            config.model.variant = model;
        }
        if let Some(video) = &self.video {
            config.video.source = video.clone();
        }
        if let Some(iou) = self.iou {
            config.detection.iou_threshold = iou;
        }
        if let Some(score) = self.score {
            config.detection.score_threshold = score;
        }
        if let Some(output) = &self.output {
            config.video.output = Some(output.clone());
        }
        if let Some(format) = &self.output_format {
            config.video.output_format = format.clone();
        }
        if self.no_display {
            config.video.display = false;
        }
        if let Some(path) = &self.summary_json {
            config.video.summary_json = Some(path.clone());
        }
    }
}
