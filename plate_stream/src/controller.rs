//! The streaming state machine.
//!
//! A `StreamController` owns the running flag, the run generation and the
//! single-slot result store behind one mutex. That lock is only held for state
//! checks and updates, never across a camera read or an OCR call.
//!
//! Each `start()` spawns a worker thread for a new generation. Workers take the
//! `Pipeline` lock for their whole run, so a new run cannot touch the camera
//! until the previous run has observed the stop and released it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};
use opencv::prelude::Mat;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::PipelineConfig;
use crate::error::{PlateError, Result};
use crate::metrics;
use crate::mjpeg::{encode_jpeg, multipart_chunk, StreamEvent, StreamPayload};
use crate::plate_detection::bounding_box_render::BoundingBoxRender;
use crate::plate_detection::dnn_ocr::PlateReader;
use crate::plate_detection::letterbox::letterbox;
use crate::plate_detection::object_detector::PlateDetector;
use crate::plate_detection::video_reader::CameraOpener;
use crate::plate_detection::PlateResult;
use crate::results::ResultStore;
use crate::utils::FpsLimiter;

const EVENT_CAPACITY: usize = 4;

/// Everything a run needs to turn camera frames into annotated JPEGs.
pub struct Pipeline {
    pub camera: Box<dyn CameraOpener>,
    /// `None` when the model failed to load; frames are streamed without detection.
    pub detector: Option<Box<dyn PlateDetector>>,
    pub reader: PlateReader,
    pub render: BoundingBoxRender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { generation: u64 },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub generation: u64,
    pub active: bool,
    pub active_for_ms: Option<u64>,
    pub frames: u64,
    pub latest_plate: Option<String>,
    pub detector_loaded: bool,
}

struct ActiveLoop {
    generation: u64,
    started: Instant,
}

struct Inner {
    state: StreamState,
    generation: u64,
    active: Option<ActiveLoop>,
    results: ResultStore,
    frames: u64,
    workers: Vec<JoinHandle<()>>,
}

pub struct StreamController {
    inner: Mutex<Inner>,
    pipeline: Mutex<Pipeline>,
    config: PipelineConfig,
    events: broadcast::Sender<StreamEvent>,
    detector_loaded: bool,
}

/// Marks the run finished even when the worker unwinds.
struct RunGuard<'a> {
    controller: &'a StreamController,
    generation: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.controller.finish(self.generation);
        self.controller.emit(self.generation, StreamPayload::Closed);
    }
}

impl StreamController {
    /// A stopped controller; nothing runs until `start()`.
    pub fn new(pipeline: Pipeline, results: ResultStore, config: PipelineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let detector_loaded = pipeline.detector.is_some();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: StreamState::Stopped,
                generation: 0,
                active: None,
                results,
                frames: 0,
                workers: Vec::new(),
            }),
            pipeline: Mutex::new(pipeline),
            config,
            events,
            detector_loaded,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| PlateError::StatePoisoned)
    }

    pub fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        let mut inner = self.lock()?;
        if inner.state == StreamState::Running {
            warn!("Stream {} already running, ignoring start", inner.generation);
            return Ok(StartOutcome::AlreadyRunning);
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.results.clear();
        inner.workers.retain(|worker| !worker.is_finished());

        let controller = Arc::clone(self);
        let worker = thread::Builder::new()
            .name(format!("plate-stream-{}", generation))
            .spawn(move || controller.run(generation))
            .map_err(|e| PlateError::Thread(e.to_string()))?;

        inner.state = StreamState::Running;
        inner.active = Some(ActiveLoop {
            generation,
            started: Instant::now(),
        });
        inner.workers.push(worker);
        metrics::STREAM_RUNNING.set(1);
        metrics::STREAM_RUNS.inc();
        info!("Stream {} started, results cleared", generation);
        Ok(StartOutcome::Started { generation })
    }

    /// Requests the active run to stop; it exits at the top of its next iteration.
    pub fn stop(&self) -> Result<StopOutcome> {
        let mut inner = self.lock()?;
        if inner.state == StreamState::Stopped {
            debug!("Stream already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }

        inner.state = StreamState::Stopped;
        if let Some(active) = inner.active.take() {
            info!(
                "Stream {} stopping after {:?}",
                active.generation,
                active.started.elapsed()
            );
        }
        metrics::STREAM_RUNNING.set(0);
        Ok(StopOutcome::Stopped)
    }

    pub fn status(&self) -> Result<StreamStatus> {
        let inner = self.lock()?;
        Ok(StreamStatus {
            state: inner.state,
            generation: inner.generation,
            active: inner.active.is_some(),
            active_for_ms: inner
                .active
                .as_ref()
                .map(|active| active.started.elapsed().as_millis() as u64),
            frames: inner.frames,
            latest_plate: inner.results.latest().map(ToString::to_string),
            detector_loaded: self.detector_loaded,
        })
    }

    /// The one-element `/results` payload.
    pub fn results(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.results.snapshot())
    }

    /// Attaches to the running stream, or `None` while stopped.
    pub fn subscribe(&self) -> Result<Option<(u64, broadcast::Receiver<StreamEvent>)>> {
        let inner = self.lock()?;
        if inner.state != StreamState::Running {
            return Ok(None);
        }
        Ok(Some((inner.generation, self.events.subscribe())))
    }

    /// Stops streaming and waits for every worker to exit.
    pub fn shutdown(&self) {
        if let Err(e) = self.stop() {
            error!("Cannot stop stream on shutdown: {}", e);
        }
        let workers = match self.lock() {
            Ok(mut inner) => std::mem::take(&mut inner.workers),
            Err(_) => return,
        };
        for worker in workers {
            if worker.join().is_err() {
                error!("Stream worker panicked");
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.state == StreamState::Running && inner.generation == generation,
            Err(_) => false,
        }
    }

    fn emit(&self, generation: u64, payload: StreamPayload) {
        // No subscribers is fine.
        let _ = self.events.send(StreamEvent {
            generation,
            payload,
        });
    }

    fn finish(&self, generation: u64) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        if inner.generation == generation && inner.state == StreamState::Running {
            inner.state = StreamState::Stopped;
            inner.active = None;
            metrics::STREAM_RUNNING.set(0);
            warn!("Stream {} ended on its own", generation);
        }
    }

    /// Stores this frame's outcome; false once the run has been stopped or superseded.
    fn publish(&self, generation: u64, plate: Option<PlateResult>) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        if inner.state != StreamState::Running || inner.generation != generation {
            return false;
        }
        if let Some(plate) = &plate {
            info!("Recognized plate {}", plate);
            metrics::PLATES_RECOGNIZED.inc();
        }
        inner.results.publish(plate);
        inner.frames += 1;
        true
    }

    fn run(self: Arc<Self>, generation: u64) {
        let _guard = RunGuard {
            controller: &self,
            generation,
        };
        let mut pipeline = self
            .pipeline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Err(e) = self.stream_frames(&mut pipeline, generation) {
            error!("Stream {} failed: {}", generation, e);
            self.emit(generation, StreamPayload::Error(e.to_string()));
        }
    }

    fn stream_frames(&self, pipeline: &mut Pipeline, generation: u64) -> Result<()> {
        if !self.is_current(generation) {
            debug!("Stream {} superseded before opening the camera", generation);
            return Ok(());
        }

        let mut camera = pipeline.camera.open()?;
        let mut limiter = FpsLimiter::new(self.config.frame_interval);

        while self.is_current(generation) {
            let mut frame = match camera.read() {
                Ok(frame) => frame,
                Err(e) => {
                    metrics::FRAME_READ_FAILURES.inc();
                    warn!("{}, retrying in {:?}", e, self.config.read_retry);
                    thread::sleep(self.config.read_retry);
                    continue;
                }
            };

            let timer = metrics::FRAME_PROCESSING_SECONDS.start_timer();
            let plate = match self.recognize_frame(pipeline, &mut frame) {
                Ok(plate) => plate,
                Err(e) => {
                    warn!("Detection skipped for this frame: {}", e);
                    None
                }
            };
            if !self.publish(generation, plate) {
                break;
            }

            let jpeg = encode_jpeg(&frame, self.config.jpeg_quality)?;
            timer.observe_duration();
            metrics::FRAMES_PROCESSED.inc();
            self.emit(generation, StreamPayload::Chunk(multipart_chunk(&jpeg)));

            limiter.wait();
        }

        info!("Stream {} leaving frame loop", generation);
        Ok(())
    }

    /// Detects, reads and annotates at most one plate in `frame`.
    fn recognize_frame(
        &self,
        pipeline: &mut Pipeline,
        frame: &mut Mat,
    ) -> Result<Option<PlateResult>> {
        let Pipeline {
            detector,
            reader,
            render,
            ..
        } = pipeline;
        let detector = match detector.as_mut() {
            Some(detector) => detector,
            None => return Ok(None),
        };

        let input = letterbox(frame, self.config.input_size)?;
        let detections = detector.detect(&input)?;
        let first = match detections.first() {
            Some(first) => *first,
            None => return Ok(None),
        };
        debug!(
            "Reading plate in {:?} (confidence {:.2}, {} candidates)",
            first.bbox,
            first.confidence,
            detections.len()
        );

        let plate = match reader.recognize(frame, first.bbox) {
            Ok(plate) => plate,
            Err(PlateError::OcrUnavailable(reason)) => {
                warn!("OCR unavailable: {}", reason);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if let Some(plate) = &plate {
            if let Err(e) = render.render(frame, first.bbox, plate.as_str()) {
                warn!("Cannot annotate plate {}: {}", plate, e);
            }
        }
        Ok(plate)
    }
}
