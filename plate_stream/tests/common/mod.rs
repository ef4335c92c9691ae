#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use opencv::core::{Rect, Scalar, CV_8UC3};
use opencv::imgproc::{rectangle, FILLED, LINE_8};
use opencv::prelude::{Mat, MatTraitConstManual};

use plate_stream::config::PipelineConfig;
use plate_stream::controller::{Pipeline, StreamController};
use plate_stream::error::{PlateError, Result};
use plate_stream::plate_detection::bounding_box_render::BoundingBoxRender;
use plate_stream::plate_detection::dnn_ocr::{PlateReader, TextRecognizer};
use plate_stream::plate_detection::letterbox::Letterbox;
use plate_stream::plate_detection::object_detector::{Detection, PlateDetector};
use plate_stream::plate_detection::video_reader::{CameraOpener, FrameSource};
use plate_stream::results::ResultStore;

pub const PLATE_BOX: Rect = Rect {
    x: 40,
    y: 50,
    width: 80,
    height: 20,
};

/// A black 160x120 frame, with a white plate-shaped block when `with_plate`.
pub fn frame(with_plate: bool) -> Mat {
    let mut frame =
        Mat::new_rows_cols_with_default(120, 160, CV_8UC3, Scalar::all(0.0)).unwrap();
    if with_plate {
        rectangle(&mut frame, PLATE_BOX, Scalar::all(255.0), FILLED, LINE_8, 0).unwrap();
    }
    frame
}

#[derive(Default)]
pub struct CameraStats {
    pub opens: AtomicUsize,
    pub releases: AtomicUsize,
    pub open_now: AtomicUsize,
    pub max_open: AtomicUsize,
    pub reads: AtomicUsize,
}

impl CameraStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub enum Feed {
    /// Every read returns the same kind of frame.
    Constant(bool),
    /// One frame per message; reads time out while the test is silent.
    Gated(Arc<Mutex<Receiver<bool>>>),
    /// Reads succeed with an empty image.
    Empty,
    /// No device can be opened.
    Missing,
    /// Opening blocks until the test signals, then finds no device.
    MissingAfter(Arc<Mutex<Receiver<()>>>),
}

pub struct FakeCamera {
    pub feed: Feed,
    pub failing_reads: usize,
    pub stats: Arc<CameraStats>,
}

impl FakeCamera {
    pub fn new(feed: Feed) -> (Self, Arc<CameraStats>) {
        let stats = Arc::new(CameraStats::default());
        (
            Self {
                feed,
                failing_reads: 0,
                stats: stats.clone(),
            },
            stats,
        )
    }
}

impl CameraOpener for FakeCamera {
    fn open(&mut self) -> Result<Box<dyn FrameSource>> {
        match &self.feed {
            Feed::Missing => return Err(PlateError::DeviceUnavailable(vec![0, 1, 2])),
            Feed::MissingAfter(gate) => {
                let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
                return Err(PlateError::DeviceUnavailable(vec![0, 1, 2]));
            }
            _ => {}
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            feed: self.feed.clone(),
            failing_reads: self.failing_reads,
            stats: self.stats.clone(),
        }))
    }
}

struct FakeSource {
    feed: Feed,
    failing_reads: usize,
    stats: Arc<CameraStats>,
}

impl FrameSource for FakeSource {
    fn read(&mut self) -> Result<Mat> {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(PlateError::FrameReadFailure("scripted failure".to_string()));
        }
        match &self.feed {
            Feed::Constant(with_plate) => Ok(frame(*with_plate)),
            Feed::Gated(rx) => {
                let next = rx.lock().unwrap().recv_timeout(Duration::from_millis(20));
                match next {
                    Ok(with_plate) => Ok(frame(with_plate)),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Err(
                        PlateError::FrameReadFailure("no frame queued".to_string()),
                    ),
                }
            }
            Feed::Empty => Ok(Mat::default()),
            Feed::Missing | Feed::MissingAfter(_) => unreachable!(),
        }
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.stats.open_now.fetch_sub(1, Ordering::SeqCst);
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reports the bounding box of pure white pixels in the tensor's first plane.
pub struct WhiteBoxDetector;

impl PlateDetector for WhiteBoxDetector {
    fn detect(&mut self, input: &Letterbox) -> Result<Vec<Detection>> {
        let size = input.input_size as usize;
        let data = input.tensor.data_typed::<f32>()?;
        let (mut x1, mut y1, mut x2, mut y2) = (usize::MAX, usize::MAX, 0, 0);
        for (i, &value) in data[..size * size].iter().enumerate() {
            if value > 0.9 {
                let (x, y) = (i % size, i / size);
                x1 = x1.min(x);
                y1 = y1.min(y);
                x2 = x2.max(x + 1);
                y2 = y2.max(y + 1);
            }
        }
        if x1 == usize::MAX {
            return Ok(Vec::new());
        }
        Ok(vec![Detection {
            bbox: input.restore_box(x1 as f32, y1 as f32, x2 as f32, y2 as f32),
            confidence: 0.9,
            class_id: 0,
        }])
    }
}

/// Reads "ABC1234" from bright crops and noise from anything else.
pub struct BrightTextOcr;

impl TextRecognizer for BrightTextOcr {
    fn read_text(&mut self, image: &Mat) -> Result<String> {
        let bytes = image.data_bytes()?;
        let mean = bytes.iter().map(|&b| b as u64).sum::<u64>() / bytes.len().max(1) as u64;
        Ok(if mean > 128 { "abc1234\n" } else { "?" }.to_string())
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        input_size: 64,
        frame_interval: Duration::from_millis(5),
        read_retry: Duration::from_millis(5),
        jpeg_quality: 80,
    }
}

pub fn pipeline(camera: FakeCamera) -> Pipeline {
    Pipeline {
        camera: Box::new(camera),
        detector: Some(Box::new(WhiteBoxDetector)),
        reader: PlateReader::new(Box::new(BrightTextOcr), false),
        render: BoundingBoxRender::default(),
    }
}

pub fn controller(feed: Feed) -> (Arc<StreamController>, Arc<CameraStats>) {
    let (camera, stats) = FakeCamera::new(feed);
    let controller =
        StreamController::new(pipeline(camera), ResultStore::default(), test_config());
    (controller, stats)
}

/// Polls `condition` for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
