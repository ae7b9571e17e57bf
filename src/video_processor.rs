// src/video_processor.rs
//
// Frame sources, sinks and the preview window. Directories of still images
// work out of the box; video containers and the preview window need the
// `opencv` feature.

use crate::types::VideoConfig;
use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Result of asking a source for its next frame.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(RgbImage),
    EndOfStream,
    /// The source could not produce the frame. Whether that ends the run
    /// cleanly or fails it depends on the declared frame count.
    Unreadable(String),
}

pub trait FrameSource {
    fn read(&mut self) -> ReadOutcome;

    /// Frame count the container claims to hold, if it reports one.
    fn declared_frame_count(&self) -> Option<u64>;

    fn fps(&self) -> f64 {
        25.0
    }
}

pub trait FrameSink {
    fn write(&mut self, frame: &RgbImage) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait Preview {
    /// Show a frame; returns true when the user asked to quit.
    fn show(&mut self, frame: &RgbImage) -> Result<bool>;
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ============================================================================
// IMAGE SEQUENCES
// ============================================================================

/// Reads every PNG/JPEG in a directory, in file-name order.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
            if entry.file_type().is_file() && has_extension(entry.path(), &FRAME_EXTENSIONS) {
                files.push(entry.into_path());
            }
        }

        info!("Found {} frames in {}", files.len(), dir.display());
        Ok(Self { files, next: 0 })
    }
}

impl FrameSource for ImageSequenceSource {
    fn read(&mut self) -> ReadOutcome {
        let Some(path) = self.files.get(self.next) else {
            return ReadOutcome::EndOfStream;
        };
        self.next += 1;

        match image::open(path) {
            Ok(img) => ReadOutcome::Frame(img.to_rgb8()),
            Err(e) => ReadOutcome::Unreadable(format!("{}: {}", path.display(), e)),
        }
    }

    fn declared_frame_count(&self) -> Option<u64> {
        Some(self.files.len() as u64)
    }
}

/// Writes `frame_000000.png`, `frame_000001.png`, ... into a directory.
pub struct ImageSequenceSink {
    dir: PathBuf,
    written: u64,
}

impl ImageSequenceSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        info!("Output frames: {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for ImageSequenceSink {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        let path = self.dir.join(format!("frame_{:06}.png", self.written));
        frame
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.written += 1;
        Ok(())
    }
}

// ============================================================================
// FACTORIES
// ============================================================================

pub fn open_source(config: &VideoConfig) -> Result<Box<dyn FrameSource + Send>> {
    let path = Path::new(&config.source);
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path)?));
    }

    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(opencv_io::OpenCvVideoSource::open(path)?))
    }

    #[cfg(not(feature = "opencv"))]
    {
        Err(crate::error::ConfigError::Invalid {
            field: "video.source",
            reason: format!(
                "{} is not a frame directory and video decoding needs the `opencv` feature",
                path.display()
            ),
        }
        .into())
    }
}

/// Output sink for `video.output`, if one is configured. Paths with a video
/// extension get a container writer; anything else is a frame directory.
pub fn open_sink(config: &VideoConfig, fps: f64) -> Result<Option<Box<dyn FrameSink + Send>>> {
    let Some(output) = config.output.as_deref() else {
        return Ok(None);
    };
    let path = Path::new(output);

    if !has_extension(path, &VIDEO_EXTENSIONS) {
        return Ok(Some(Box::new(ImageSequenceSink::create(path)?)));
    }

    #[cfg(feature = "opencv")]
    {
        Ok(Some(Box::new(opencv_io::OpenCvVideoSink::new(
            path,
            &config.output_format,
            fps,
        )?)))
    }

    #[cfg(not(feature = "opencv"))]
    {
        let _ = fps;
        Err(crate::error::ConfigError::Invalid {
            field: "video.output",
            reason: format!("writing {} needs the `opencv` feature", path.display()),
        }
        .into())
    }
}

pub fn open_preview(config: &VideoConfig) -> Option<Box<dyn Preview + Send>> {
    if !config.display {
        return None;
    }

    #[cfg(feature = "opencv")]
    {
        Some(Box::new(opencv_io::OpenCvPreview::new("lanewatch")))
    }

    #[cfg(not(feature = "opencv"))]
    {
        tracing::warn!("Preview window needs the `opencv` feature; running headless");
        None
    }
}

// ============================================================================
// OPENCV
// ============================================================================

#[cfg(feature = "opencv")]
mod opencv_io {
    use super::{FrameSink, FrameSource, Preview, ReadOutcome};
    use anyhow::{bail, Context, Result};
    use image::RgbImage;
    use opencv::{
        core::{Mat, Size},
        highgui, imgproc,
        prelude::*,
        videoio::{self, VideoCapture, VideoWriter},
    };
    use std::path::{Path, PathBuf};
    use tracing::{info, warn};

    fn mat_to_rgb(mat: &Mat) -> Result<RgbImage> {
        let mut rgb = Mat::default();
        imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let data = rgb.data_bytes()?.to_vec();
        RgbImage::from_raw(rgb.cols() as u32, rgb.rows() as u32, data)
            .context("Decoded frame has an unexpected layout")
    }

    fn rgb_to_mat(image: &RgbImage) -> Result<Mat> {
        let mat = Mat::from_slice(image.as_raw())?;
        let reshaped = mat.reshape(3, image.height() as i32)?;
        let mut bgr = Mat::default();
        imgproc::cvt_color(&reshaped, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
        Ok(bgr)
    }

    pub struct OpenCvVideoSource {
        cap: VideoCapture,
        fps: f64,
        total_frames: Option<u64>,
    }

    impl OpenCvVideoSource {
        pub fn open(path: &Path) -> Result<Self> {
            info!("Opening video: {}", path.display());
            let name = path.to_str().context("Video path is not valid UTF-8")?;
            let cap = VideoCapture::from_file(name, videoio::CAP_ANY)?;
            if !cap.is_opened()? {
                bail!("Failed to open video file {}", path.display());
            }

            let fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
            let count = cap.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0);
            let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0);
            let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0);
            info!(
                "Video properties: {}x{} @ {:.1} FPS, {} frames",
                width, height, fps, count
            );

            Ok(Self {
                cap,
                fps: if fps > 0.0 { fps } else { 25.0 },
                total_frames: (count > 0.0).then_some(count as u64),
            })
        }
    }

    impl FrameSource for OpenCvVideoSource {
        fn read(&mut self) -> ReadOutcome {
            let mut mat = Mat::default();
            match self.cap.read(&mut mat) {
                Ok(true) if !mat.empty() => match mat_to_rgb(&mat) {
                    Ok(rgb) => ReadOutcome::Frame(rgb),
                    Err(e) => ReadOutcome::Unreadable(format!("{:#}", e)),
                },
                // The backend does not tell a corrupt packet apart from the
                // end of the file; the orchestrator decides via the count.
                Ok(_) => ReadOutcome::Unreadable("no frame returned".to_string()),
                Err(e) => ReadOutcome::Unreadable(e.to_string()),
            }
        }

        fn declared_frame_count(&self) -> Option<u64> {
            self.total_frames
        }

        fn fps(&self) -> f64 {
            self.fps
        }
    }

    /// Container writer; opened on the first frame so the size is known.
    pub struct OpenCvVideoSink {
        path: PathBuf,
        fourcc: i32,
        fps: f64,
        writer: Option<VideoWriter>,
    }

    impl OpenCvVideoSink {
        pub fn new(path: &Path, output_format: &str, fps: f64) -> Result<Self> {
            let code: Vec<char> = output_format.chars().collect();
            let [a, b, c, d] = code[..] else {
                bail!("Output format must be a four character code, got {}", output_format);
            };
            let fourcc = VideoWriter::fourcc(a, b, c, d)?;
            info!("Output video: {} ({})", path.display(), output_format);
            Ok(Self {
                path: path.to_path_buf(),
                fourcc,
                fps,
                writer: None,
            })
        }
    }

    impl FrameSink for OpenCvVideoSink {
        fn write(&mut self, frame: &RgbImage) -> Result<()> {
            if self.writer.is_none() {
                let name = self.path.to_str().context("Output path is not valid UTF-8")?;
                let writer = VideoWriter::new(
                    name,
                    self.fourcc,
                    self.fps,
                    Size::new(frame.width() as i32, frame.height() as i32),
                    true,
                )?;
                if !writer.is_opened()? {
                    bail!("Failed to open video writer {}", self.path.display());
                }
                self.writer = Some(writer);
            }

            let mat = rgb_to_mat(frame)?;
            if let Some(writer) = self.writer.as_mut() {
                writer.write(&mat)?;
            }
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.release()?;
            }
            Ok(())
        }
    }

    pub struct OpenCvPreview {
        window: String,
    }

    impl OpenCvPreview {
        pub fn new(window: &str) -> Self {
            Self {
                window: window.to_string(),
            }
        }
    }

    impl Preview for OpenCvPreview {
        fn show(&mut self, frame: &RgbImage) -> Result<bool> {
            let mat = rgb_to_mat(frame)?;
            highgui::imshow(&self.window, &mat)?;
            let key = highgui::wait_key(1)?;
            Ok(key == 'q' as i32)
        }
    }

    impl Drop for OpenCvPreview {
        fn drop(&mut self) {
            if let Err(e) = highgui::destroy_all_windows() {
                warn!("Failed to close preview window: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_sequence_reads_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([2, 2, 2]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        assert_eq!(source.declared_frame_count(), Some(2));

        match source.read() {
            ReadOutcome::Frame(img) => assert_eq!(*img.get_pixel(0, 0), Rgb([1, 1, 1])),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(matches!(source.read(), ReadOutcome::Frame(_)));
        assert!(matches!(source.read(), ReadOutcome::EndOfStream));
    }

    #[test]
    fn test_corrupt_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("000.png"), b"not a png").unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        assert!(matches!(source.read(), ReadOutcome::Unreadable(_)));
    }

    #[test]
    fn test_sink_numbers_frames() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut sink = ImageSequenceSink::create(&out).unwrap();
        sink.write(&RgbImage::new(3, 3)).unwrap();
        sink.write(&RgbImage::new(3, 3)).unwrap();

        assert_eq!(sink.written(), 2);
        assert!(out.join("frame_000000.png").exists());
        assert!(out.join("frame_000001.png").exists());
    }

    #[test]
    fn test_no_output_means_no_sink() {
        let config = VideoConfig::default();
        assert!(open_sink(&config, 25.0).unwrap().is_none());
    }

    #[test]
    fn test_disabled_display_has_no_preview() {
        let config = VideoConfig {
            display: false,
            ..VideoConfig::default()
        };
        assert!(open_preview(&config).is_none());
    }
}
