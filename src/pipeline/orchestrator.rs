// src/pipeline/orchestrator.rs
//
// The per-frame control loop, written as an explicit state machine:
//
//   Idle → Reading ─┬─▶ Preprocessing → Inferring → Decoding → ExtractingLanes
//                   │        → Compositing → Emitting ─┬─▶ Reading
//                   │                                  └─▶ Done (cancelled)
//                   ├─▶ Done    (end of stream, or cancelled before the read)
//                   └─▶ Failed  (unreadable frame before the declared end)
//
// Any stage error moves straight to Failed. One frame is in flight at a time
// and frames leave in the order they were read.

use super::frame_context::FrameContext;
use super::metrics::{Telemetry, TelemetrySummary};
use crate::annotation::{draw_detections, ClassNames};
use crate::compositor::composite;
use crate::error::{PipelineError, Stage};
use crate::inference::InferenceBackend;
use crate::lane_detection::LaneExtractor;
use crate::object_detection::{DetectionDecoder, HeadLayout, RawDetections};
use crate::preprocessing::preprocess;
use crate::types::{Config, Frame};
use crate::video_processor::{FrameSink, FrameSource, Preview, ReadOutcome};
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Reading,
    Preprocessing,
    Inferring,
    Decoding,
    ExtractingLanes,
    Compositing,
    Emitting,
    Done,
    Failed,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The source ran out of frames.
    Completed,
    /// Ctrl-C or the preview's quit key, observed at a frame boundary.
    Cancelled,
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: TelemetrySummary,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed(_))
    }
}

/// What happened to the frame that just went through the loop.
enum FrameResult {
    Emitted,
    QuitRequested,
}

fn stage_error(stage: Stage, frame_index: u64) -> impl FnOnce(anyhow::Error) -> PipelineError {
    move |source| PipelineError::Stage {
        stage,
        frame_index,
        source,
    }
}

pub struct PipelineOrchestrator {
    config: Config,
    backend: Box<dyn InferenceBackend + Send>,
    layout: HeadLayout,
    decoder: DetectionDecoder,
    class_names: ClassNames,
    lanes: LaneExtractor,
    source: Box<dyn FrameSource + Send>,
    sink: Option<Box<dyn FrameSink + Send>>,
    preview: Option<Box<dyn Preview + Send>>,
    cancel: Arc<AtomicBool>,
    telemetry: Telemetry,
    state: PipelineState,
    frames_read: u64,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Config,
        backend: Box<dyn InferenceBackend + Send>,
        source: Box<dyn FrameSource + Send>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        Ok(Self {
            layout: HeadLayout::from_model(&config.model),
            decoder: DetectionDecoder::new(config.detection.clone()),
            lanes: LaneExtractor::from_config(&config.lanes),
            class_names: ClassNames::default(),
            backend,
            source,
            sink: None,
            preview: None,
            cancel: Arc::new(AtomicBool::new(false)),
            telemetry: Telemetry::new(),
            state: PipelineState::Idle,
            frames_read: 0,
            config,
        })
    }

    pub fn with_sink(mut self, sink: Option<Box<dyn FrameSink + Send>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_preview(mut self, preview: Option<Box<dyn Preview + Send>>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_class_names(mut self, names: ClassNames) -> Self {
        self.class_names = names;
        self
    }

    /// Setting the returned flag stops the run before the next frame is read.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        trace!("Pipeline state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn run(&mut self) -> RunReport {
        info!("▶ Pipeline started");
        let outcome = match self.run_loop() {
            Ok(outcome) => {
                self.transition(PipelineState::Done);
                outcome
            }
            Err(e) => {
                self.transition(PipelineState::Failed);
                error!("❌ {}", e);
                RunOutcome::Failed(e)
            }
        };

        let outcome = self.finish_sink(outcome);

        let summary = self.telemetry.summary();
        summary.log();
        match &outcome {
            RunOutcome::Completed => info!("✓ Pipeline finished: end of stream"),
            RunOutcome::Cancelled => info!("✓ Pipeline finished: cancelled"),
            RunOutcome::Failed(_) => {}
        }

        RunReport { outcome, summary }
    }

    fn run_loop(&mut self) -> Result<RunOutcome, PipelineError> {
        loop {
            self.transition(PipelineState::Reading);
            if self.cancel.load(Ordering::Relaxed) {
                info!("⏹️  Stop requested before frame {}", self.frames_read);
                return Ok(RunOutcome::Cancelled);
            }
            let image = match self.source.read() {
                ReadOutcome::Frame(image) => image,
                ReadOutcome::EndOfStream => return Ok(RunOutcome::Completed),
                ReadOutcome::Unreadable(reason) => {
                    self.end_of_stream_or_fatal(reason)?;
                    return Ok(RunOutcome::Completed);
                }
            };

            let frame = Frame {
                index: self.frames_read,
                image,
            };
            self.frames_read += 1;

            let result = self.process_frame(frame)?;

            if matches!(result, FrameResult::QuitRequested) || self.cancel.load(Ordering::Relaxed) {
                info!("⏹️  Stop requested after frame {}", self.frames_read - 1);
                return Ok(RunOutcome::Cancelled);
            }
        }
    }

    /// A read failure ends the run cleanly only once the source's declared
    /// frame count has been reached (or when the count is not trusted).
    fn end_of_stream_or_fatal(&self, reason: String) -> Result<(), PipelineError> {
        let frame_index = self.frames_read;
        match self.source.declared_frame_count() {
            Some(declared) if self.config.video.trust_frame_count && frame_index < declared => {
                Err(PipelineError::FatalStream {
                    frame_index,
                    reason,
                })
            }
            declared => {
                warn!(
                    "Unreadable frame {} (declared count {:?}); treating as end of stream: {}",
                    frame_index, declared, reason
                );
                Ok(())
            }
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<FrameResult, PipelineError> {
        let index = frame.index;
        let input_size = self.config.model.input_size;
        let mut ctx = FrameContext::new(frame);
        let started = Instant::now();

        self.transition(PipelineState::Preprocessing);
        let input = preprocess(&ctx.frame.image, input_size)
            .map_err(stage_error(Stage::Preprocess, index))?;

        self.transition(PipelineState::Inferring);
        let outputs = self
            .backend
            .infer(&input)
            .map_err(stage_error(Stage::Inference, index))?;

        self.transition(PipelineState::Decoding);
        let raw = RawDetections::from_outputs(outputs, self.layout, input_size)
            .map_err(|e| stage_error(Stage::Decode, index)(e.into()))?;
        let detections = self
            .decoder
            .decode(&raw)
            .map_err(|e| stage_error(Stage::Decode, index)(e.into()))?
            .into_iter()
            .next()
            .ok_or_else(|| stage_error(Stage::Decode, index)(anyhow!("detector returned an empty batch")))?;
        let (annotated, detected) = draw_detections(&ctx.frame.image, &detections, &self.class_names);
        ctx.detections = Some(detections);
        ctx.detected_classes = detected;

        self.transition(PipelineState::ExtractingLanes);
        let extraction = self
            .lanes
            .extract(&annotated)
            .map_err(stage_error(Stage::LaneExtraction, index))?;

        self.transition(PipelineState::Compositing);
        let output = composite(&annotated, &extraction.overlay, &self.config.compositor)
            .map_err(stage_error(Stage::Composite, index))?;
        ctx.lane_lines = extraction.lines;
        ctx.exec_time = started.elapsed();

        self.transition(PipelineState::Emitting);
        let mut quit = false;
        if let Some(preview) = self.preview.as_mut() {
            quit = preview
                .show(&output)
                .map_err(stage_error(Stage::Emit, index))?;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.write(&output).map_err(stage_error(Stage::Emit, index))?;
        }
        self.telemetry.record(ctx.exec_time);

        debug!(
            "Frame {}: {} detections {:?}, {} lane segments accepted, {:.2}ms",
            ctx.index(),
            ctx.detection_count(),
            ctx.detected_classes,
            ctx.accepted_lanes(),
            ctx.exec_time.as_secs_f64() * 1000.0
        );

        Ok(if quit {
            FrameResult::QuitRequested
        } else {
            FrameResult::Emitted
        })
    }

    fn finish_sink(&mut self, outcome: RunOutcome) -> RunOutcome {
        let Some(sink) = self.sink.as_mut() else {
            return outcome;
        };
        match (sink.finish(), outcome) {
            (Ok(()), outcome) => outcome,
            (Err(e), RunOutcome::Failed(original)) => {
                warn!("Failed to finalize output after error: {:#}", e);
                RunOutcome::Failed(original)
            }
            (Err(e), _) => {
                self.transition(PipelineState::Failed);
                let err = stage_error(Stage::Emit, self.frames_read)(e);
                error!("❌ {}", err);
                RunOutcome::Failed(err)
            }
        }
    }
}
