use std::path::PathBuf;

use log::{debug, info};
use opencv::core::Rect;
use opencv::core::Scalar;
use opencv::core::Vector;
use opencv::dnn;
use opencv::dnn::nms_boxes;
use opencv::dnn::Net;
use opencv::dnn::DNN_BACKEND_CUDA;
use opencv::dnn::DNN_BACKEND_OPENCV;
use opencv::dnn::DNN_TARGET_CPU;
use opencv::dnn::DNN_TARGET_CUDA;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;
use opencv::prelude::NetTrait;
use opencv::prelude::NetTraitConst;

use super::letterbox::Letterbox;
use crate::error::{PlateError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Box in source frame pixels.
    pub bbox: Rect,
    pub confidence: f32,
    pub class_id: i32,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub use_gpu: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/plate_detect.onnx"),
            conf_threshold: 0.3,
            iou_threshold: 0.5,
            use_gpu: false,
        }
    }
}

/// Finds candidate plate regions in a letterboxed frame.
///
/// Implementations return detections in source frame coordinates, highest confidence first.
pub trait PlateDetector: Send {
    fn detect(&mut self, input: &Letterbox) -> Result<Vec<Detection>>;
}

/// Decodes YOLOv5 output rows `[cx, cy, w, h, objectness, class scores...]`.
#[derive(Debug, Clone, Copy)]
pub struct YoloProcessorV5 {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl YoloProcessorV5 {
    /// Keeps rows whose objectness and combined score pass the threshold, then
    /// suppresses overlaps. `rows` is row-major with `stride` values per candidate.
    pub fn post_process(
        &self,
        rows: &[f32],
        stride: usize,
        input: &Letterbox,
    ) -> Result<Vec<Detection>> {
        if stride < 6 {
            return Err(PlateError::ModelUnavailable(format!(
                "unexpected output stride {}",
                stride
            )));
        }

        let mut candidates = Vec::new();
        for row in rows.chunks_exact(stride) {
            let objectness = row[4];
            if objectness <= self.conf_threshold {
                continue;
            }
            let (class_id, class_score) = row[5..]
                .iter()
                .enumerate()
                .fold((0usize, f32::MIN), |best, (i, &score)| {
                    if score > best.1 {
                        (i, score)
                    } else {
                        best
                    }
                });
            let confidence = objectness * class_score;
            if confidence <= self.conf_threshold {
                continue;
            }

            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = input.restore_box(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
            if bbox.width > 0 && bbox.height > 0 {
                candidates.push(Detection {
                    bbox,
                    confidence,
                    class_id: class_id as i32,
                });
            }
        }

        self.suppress(candidates)
    }

    /// Non-max suppression; the result is ordered by descending confidence.
    pub fn suppress(&self, candidates: Vec<Detection>) -> Result<Vec<Detection>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let boxes: Vector<Rect> = candidates.iter().map(|d| d.bbox).collect();
        let confidences: Vector<f32> = candidates.iter().map(|d| d.confidence).collect();
        let mut indices = Vector::<i32>::default();
        nms_boxes(
            &boxes,
            &confidences,
            self.conf_threshold,
            self.iou_threshold,
            &mut indices,
            1.0,
            0,
        )?;

        let mut output: Vec<Detection> = indices
            .iter()
            .filter_map(|i| candidates.get(i as usize).copied())
            .collect();
        output.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(output)
    }
}

pub struct ObjectDetector {
    classifier: Net,
    post_processor: YoloProcessorV5,
}

impl ObjectDetector {
    pub fn plate_detector(config: &DetectorConfig) -> Result<Self> {
        let path = config.model_path.to_string_lossy();
        let mut classifier = dnn::read_net_from_onnx(&path)
            .map_err(|e| PlateError::ModelUnavailable(format!("{}: {}", path, e)))?;

        if config.use_gpu {
            classifier.set_preferable_backend(DNN_BACKEND_CUDA)?;
            classifier.set_preferable_target(DNN_TARGET_CUDA)?;
        } else {
            classifier.set_preferable_backend(DNN_BACKEND_OPENCV)?;
            classifier.set_preferable_target(DNN_TARGET_CPU)?;
        }
        info!(
            "Plate detector loaded from {} (gpu: {})",
            path, config.use_gpu
        );

        Ok(ObjectDetector {
            classifier,
            post_processor: YoloProcessorV5 {
                conf_threshold: config.conf_threshold,
                iou_threshold: config.iou_threshold,
            },
        })
    }
}

unsafe impl Send for ObjectDetector {}

impl PlateDetector for ObjectDetector {
    fn detect(&mut self, input: &Letterbox) -> Result<Vec<Detection>> {
        self.classifier
            .set_input(&input.tensor, "", 1.0, Scalar::default())?;

        let output_names = self.classifier.get_unconnected_out_layers_names()?;
        let mut output_values = Vector::<Mat>::default();
        self.classifier.forward(&mut output_values, &output_names)?;

        let mut detections = Vec::new();
        for output in output_values.iter() {
            let shape = output.mat_size();
            let stride = match shape.last() {
                Some(&stride) if stride > 0 => stride as usize,
                _ => continue,
            };
            let rows = output.data_typed::<f32>()?;
            detections.extend(self.post_processor.post_process(rows, stride, input)?);
        }
        if output_values.len() > 1 {
            detections = self.post_processor.suppress(detections)?;
        }

        debug!("Detector returned {} candidates", detections.len());
        Ok(detections)
    }
}
