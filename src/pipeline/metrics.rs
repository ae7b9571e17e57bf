// src/pipeline/metrics.rs
//
// Per-frame processing time, accumulated over a run and summarized at
// shutdown.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    pub frame_count: u64,
    pub total_exec_time: Duration,
}

impl RunningStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.frame_count += 1;
        self.total_exec_time += elapsed;
    }

    /// `None` until at least one frame has been recorded.
    pub fn average(&self) -> Option<Duration> {
        if self.frame_count == 0 {
            return None;
        }
        Some(match u32::try_from(self.frame_count) {
            Ok(n) => self.total_exec_time / n,
            Err(_) => self.total_exec_time.div_f64(self.frame_count as f64),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    stats: RunningStats,
    started_at: Instant,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            stats: RunningStats::default(),
            started_at: Instant::now(),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.stats.record(elapsed);
    }

    pub fn stats(&self) -> RunningStats {
        self.stats
    }

    pub fn summary(&self) -> TelemetrySummary {
        let average = self.stats.average();
        TelemetrySummary {
            frame_count: self.stats.frame_count,
            total_exec_secs: self.stats.total_exec_time.as_secs_f64(),
            average_secs: average.map(|d| d.as_secs_f64()),
            fps: average
                .filter(|d| !d.is_zero())
                .map(|d| 1.0 / d.as_secs_f64()),
            wall_clock_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySummary {
    pub frame_count: u64,
    pub total_exec_secs: f64,
    /// Absent when no frame was processed.
    pub average_secs: Option<f64>,
    pub fps: Option<f64>,
    pub wall_clock_secs: f64,
}

impl TelemetrySummary {
    pub fn has_data(&self) -> bool {
        self.average_secs.is_some()
    }

    pub fn log(&self) {
        info!("📊 Processing summary:");
        info!("  Frames processed: {}", self.frame_count);
        info!("  Total processing time: {:.3}s", self.total_exec_secs);
        match (self.average_secs, self.fps) {
            (Some(avg), Some(fps)) => {
                info!("  Average per frame: {:.2}ms ({:.1} FPS)", avg * 1000.0, fps)
            }
            (Some(avg), None) => info!("  Average per frame: {:.2}ms", avg * 1000.0),
            _ => info!("  Average per frame: no data"),
        }
        info!("  Wall clock: {:.2}s", self.wall_clock_secs);
    }
}

impl fmt::Display for TelemetrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} total={:.3}s average=",
            self.frame_count, self.total_exec_secs
        )?;
        match self.average_secs {
            Some(avg) => write!(f, "{:.2}ms", avg * 1000.0),
            None => f.write_str("no data"),
        }
    }
}
