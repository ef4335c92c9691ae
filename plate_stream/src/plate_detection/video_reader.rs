use log::{debug, info, warn};
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::VideoCaptureTrait;
use opencv::prelude::VideoCaptureTraitConst;
use opencv::videoio::VideoCapture;
use opencv::videoio::CAP_ANY;
use opencv::videoio::CAP_PROP_FPS;
use opencv::videoio::CAP_PROP_FRAME_HEIGHT;
use opencv::videoio::CAP_PROP_FRAME_WIDTH;

use crate::error::{PlateError, Result};

/// An open capture device. Dropping the source releases the device.
pub trait FrameSource: Send {
    /// Reads the next frame, failing with `FrameReadFailure` when the device yields nothing.
    fn read(&mut self) -> Result<Mat>;
}

/// Opens a fresh `FrameSource` for every streaming run.
pub trait CameraOpener: Send {
    fn open(&mut self) -> Result<Box<dyn FrameSource>>;
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub preferred_index: i32,
    pub probe_count: i32,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            preferred_index: 0,
            probe_count: 3,
            width: 640,
            height: 480,
            fps: 30.0,
        }
    }
}

impl CameraSettings {
    /// Device indices in the order they are tried: the preferred one first, then the probe range.
    pub fn probe_order(&self) -> Vec<i32> {
        let mut order = vec![self.preferred_index];
        order.extend((0..self.probe_count).filter(|i| *i != self.preferred_index));
        order
    }
}

pub struct VideoReader {
    capture: VideoCapture,
    index: i32,
}

impl VideoReader {
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        let order = settings.probe_order();
        for &index in &order {
            let mut capture = match VideoCapture::new(index, CAP_ANY) {
                Ok(capture) => capture,
                Err(e) => {
                    debug!("Camera index {} failed to open: {}", index, e);
                    continue;
                }
            };
            if !capture.is_opened().unwrap_or(false) {
                let _ = capture.release();
                continue;
            }

            capture.set(CAP_PROP_FRAME_WIDTH, settings.width as f64)?;
            capture.set(CAP_PROP_FRAME_HEIGHT, settings.height as f64)?;
            capture.set(CAP_PROP_FPS, settings.fps)?;
            info!(
                "Camera index {} opened at {}x{}@{}",
                index, settings.width, settings.height, settings.fps
            );
            return Ok(Self { capture, index });
        }

        Err(PlateError::DeviceUnavailable(order))
    }
}

impl FrameSource for VideoReader {
    fn read(&mut self) -> Result<Mat> {
        let mut image = Mat::default();
        let grabbed = self
            .capture
            .read(&mut image)
            .map_err(|e| PlateError::FrameReadFailure(e.to_string()))?;

        if !grabbed || image.empty() {
            return Err(PlateError::FrameReadFailure(format!(
                "camera {} returned no frame",
                self.index
            )));
        }
        Ok(image)
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        match self.capture.release() {
            Ok(()) => info!("Camera index {} released", self.index),
            Err(e) => warn!("Camera index {} release failed: {}", self.index, e),
        }
    }
}

unsafe impl Send for VideoReader {}

/// Opens physical capture devices through OpenCV.
pub struct DeviceCamera {
    settings: CameraSettings,
}

impl DeviceCamera {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }
}

impl CameraOpener for DeviceCamera {
    fn open(&mut self) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(VideoReader::open(&self.settings)?))
    }
}
