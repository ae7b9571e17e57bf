// src/lib.rs

pub mod annotation;
pub mod cli;
pub mod compositor;
pub mod config;
pub mod error;
pub mod hough;
pub mod inference;
pub mod lane_detection;
pub mod object_detection;
pub mod pipeline;
pub mod preprocessing;
pub mod types;
pub mod video_processor;
