// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use lanewatch::annotation::ClassNames;
use lanewatch::cli::Cli;
use lanewatch::error::PipelineError;
use lanewatch::inference::build_backend;
use lanewatch::pipeline::{PipelineOrchestrator, RunOutcome};
use lanewatch::video_processor::{open_preview, open_sink, open_source, FrameSource};
use std::sync::atomic::Ordering;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("lanewatch={},ort=warn", config.logging.level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚗 Lanewatch starting");

    config.validate().map_err(PipelineError::from)?;
    config.check_paths().map_err(PipelineError::from)?;
    info!("✓ Configuration loaded");
    info!(
        "Detection thresholds: iou={:.2}, score={:.2}, input={}px",
        config.detection.iou_threshold, config.detection.score_threshold, config.model.input_size
    );

    let backend = build_backend(&config.model)?;
    info!("✓ Inference backend ready");

    let class_names = match &config.model.class_names {
        Some(path) => ClassNames::load(path)?,
        None => ClassNames::default(),
    };

    let source = open_source(&config.video)?;
    let sink = open_sink(&config.video, source.fps())?;
    let preview = open_preview(&config.video);
    let summary_path = config.video.summary_json.clone();

    let mut pipeline = PipelineOrchestrator::new(config, backend, source)?
        .with_sink(sink)
        .with_preview(preview)
        .with_class_names(class_names);

    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current frame");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let report = tokio::task::spawn_blocking(move || pipeline.run())
        .await
        .context("Pipeline task panicked")?;

    if let Some(path) = summary_path {
        let json = serde_json::to_string_pretty(&report.summary)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path))?;
        info!("💾 Summary written to {}", path);
    }

    match report.outcome {
        RunOutcome::Failed(e) => Err(e.into()),
        RunOutcome::Completed | RunOutcome::Cancelled => Ok(()),
    }
}
