// src/pipeline/mod.rs

pub mod frame_context;
pub mod metrics;
pub mod orchestrator;

pub use frame_context::FrameContext;
pub use metrics::{RunningStats, Telemetry, TelemetrySummary};
pub use orchestrator::{PipelineOrchestrator, PipelineState, RunOutcome, RunReport};
