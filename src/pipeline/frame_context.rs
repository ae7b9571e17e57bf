// src/pipeline/frame_context.rs
//
// Everything the pipeline learns about one frame while it is in flight.
// Built when the frame is read and dropped once it has been emitted.

use crate::types::{ClassifiedLine, DetectionSet, Frame};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FrameContext {
    pub frame: Frame,
    pub detections: Option<DetectionSet>,
    pub detected_classes: Vec<String>,
    pub lane_lines: Vec<ClassifiedLine>,
    pub exec_time: Duration,
}

impl FrameContext {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            detections: None,
            detected_classes: Vec::new(),
            lane_lines: Vec::new(),
            exec_time: Duration::ZERO,
        }
    }

    pub fn index(&self) -> u64 {
        self.frame.index
    }

    pub fn detection_count(&self) -> usize {
        self.detections.as_ref().map_or(0, |d| d.valid_count)
    }

    pub fn accepted_lanes(&self) -> usize {
        self.lane_lines.iter().filter(|l| l.accepted).count()
    }
}
