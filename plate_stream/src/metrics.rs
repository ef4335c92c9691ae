use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref FRAMES_PROCESSED: IntCounter = register_int_counter!(
        "plate_frames_processed_total",
        "Frames read, processed and emitted to the stream"
    )
    .expect("metric can be registered");
    pub static ref FRAME_READ_FAILURES: IntCounter = register_int_counter!(
        "plate_frame_read_failures_total",
        "Camera reads that returned no frame"
    )
    .expect("metric can be registered");
    pub static ref PLATES_RECOGNIZED: IntCounter = register_int_counter!(
        "plate_recognized_total",
        "Frames with a validated plate"
    )
    .expect("metric can be registered");
    pub static ref OCR_REJECTED: IntCounter = register_int_counter!(
        "plate_ocr_rejected_total",
        "OCR results discarded by plate format validation"
    )
    .expect("metric can be registered");
    pub static ref STREAM_RUNNING: IntGauge = register_int_gauge!(
        "plate_stream_running",
        "1 while the frame loop is allowed to run"
    )
    .expect("metric can be registered");
    pub static ref STREAM_RUNS: IntCounter = register_int_counter!(
        "plate_stream_runs_total",
        "Frame loops started"
    )
    .expect("metric can be registered");
    pub static ref FRAME_PROCESSING_SECONDS: Histogram = register_histogram!(
        "plate_frame_processing_seconds",
        "Detection, OCR and encoding time per frame",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("metric can be registered");
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
