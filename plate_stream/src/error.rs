use thiserror::Error;

/// Failures of the capture, recognition and streaming pipeline.
#[derive(Error, Debug)]
pub enum PlateError {
    #[error("no camera device could be opened (probed indices {0:?})")]
    DeviceUnavailable(Vec<i32>),
    #[error("camera read failed: {0}")]
    FrameReadFailure(String),
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),
    #[error("frame encoding failed: {0}")]
    EncodeFailure(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("stream state lock poisoned")]
    StatePoisoned,
    #[error("cannot spawn stream thread: {0}")]
    Thread(String),
    #[error("http server error: {0}")]
    Server(String),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PlateError>;
