use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{PlateError, Result};
use crate::plate_detection::dnn_ocr::{OcrConfig, DEFAULT_PAGE_SEG_MODE};
use crate::plate_detection::object_detector::DetectorConfig;
use crate::plate_detection::video_reader::CameraSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OcrBackend {
    /// Tesseract linked into the process.
    Library,
    /// The `tesseract` executable, one process per crop.
    Command,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "plate_server")]
#[command(about = "Streams a camera over MJPEG and reports recognized license plates", long_about = None)]
pub struct Args {
    #[arg(long, env = "PLATE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PLATE_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Camera index tried first
    #[arg(long, env = "PLATE_CAMERA_INDEX", default_value_t = 0)]
    pub camera_index: i32,

    /// Number of camera indices probed when the preferred one fails
    #[arg(long, default_value_t = 3)]
    pub camera_probe: i32,

    #[arg(long, default_value_t = 640)]
    pub capture_width: i32,

    #[arg(long, default_value_t = 480)]
    pub capture_height: i32,

    #[arg(long, default_value_t = 30.0)]
    pub capture_fps: f64,

    /// ONNX plate detection model
    #[arg(long, env = "PLATE_MODEL", default_value = "models/plate_detect.onnx")]
    pub model: PathBuf,

    /// Square detector input size in pixels
    #[arg(long, default_value_t = 640)]
    pub input_size: i32,

    #[arg(long, default_value_t = 0.3)]
    pub conf_threshold: f32,

    #[arg(long, default_value_t = 0.5)]
    pub iou_threshold: f32,

    #[arg(long)]
    pub use_gpu: bool,

    #[arg(long, value_enum, default_value_t = OcrBackend::Library)]
    pub ocr_backend: OcrBackend,

    #[arg(long, env = "TESSERACT_CMD", default_value = "tesseract")]
    pub tesseract_cmd: String,

    #[arg(long, env = "TESSDATA_PREFIX")]
    pub tessdata: Option<PathBuf>,

    #[arg(long, default_value = "eng")]
    pub ocr_lang: String,

    /// Tesseract page segmentation mode (8 single word, 7 single line)
    #[arg(long, default_value_t = DEFAULT_PAGE_SEG_MODE)]
    pub page_seg_mode: u8,

    /// Grayscale and Otsu-threshold crops before OCR
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub binarize: bool,

    #[arg(long, default_value = "dataset/results.txt")]
    pub results_file: PathBuf,

    #[arg(long, default_value = "static")]
    pub static_dir: PathBuf,

    /// Operator page; a built-in page is served when the file is missing
    #[arg(long, default_value = "templates/index.html")]
    pub index_page: PathBuf,

    /// Minimum time between emitted frames, 0 to disable pacing
    #[arg(long, default_value_t = 100)]
    pub frame_interval_ms: u64,

    /// Delay before retrying a failed camera read
    #[arg(long, default_value_t = 1000)]
    pub read_retry_ms: u64,

    #[arg(long, default_value_t = 95)]
    pub jpeg_quality: i32,

    /// Start streaming without waiting for POST /start
    #[arg(long)]
    pub autostart: bool,

    #[arg(long, env = "PYROSCOPE_URL")]
    pub pyroscope_url: Option<String>,
}

/// Tunables of the frame loop.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_size: i32,
    pub frame_interval: Duration,
    pub read_retry: Duration,
    pub jpeg_quality: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            frame_interval: Duration::from_millis(100),
            read_retry: Duration::from_millis(1000),
            jpeg_quality: 95,
        }
    }
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("conf-threshold", self.conf_threshold),
            ("iou-threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PlateError::Config(format!(
                    "{} must be within 0..=1, got {}",
                    name, value
                )));
            }
        }
        if self.input_size <= 0 {
            return Err(PlateError::Config(format!(
                "input-size must be positive, got {}",
                self.input_size
            )));
        }
        if !(0..=100).contains(&self.jpeg_quality) {
            return Err(PlateError::Config(format!(
                "jpeg-quality must be within 0..=100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            preferred_index: self.camera_index,
            probe_count: self.camera_probe,
            width: self.capture_width,
            height: self.capture_height,
            fps: self.capture_fps,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            model_path: self.model.clone(),
            conf_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
            use_gpu: self.use_gpu,
        }
    }

    pub fn ocr_config(&self) -> OcrConfig {
        OcrConfig {
            data_path: self.tessdata.clone(),
            lang: self.ocr_lang.clone(),
            page_seg_mode: self.page_seg_mode,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            input_size: self.input_size,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            read_retry: Duration::from_millis(self.read_retry_ms),
            jpeg_quality: self.jpeg_quality,
        }
    }
}
