use std::ffi::CString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use leptess::tesseract;
use leptess::tesseract::TessApi;
use log::{debug, warn};
use opencv::core::Rect;
use opencv::core::Vector;
use opencv::imgcodecs::imencode;
use opencv::imgproc::cvt_color;
use opencv::imgproc::threshold;
use opencv::imgproc::COLOR_BGR2GRAY;
use opencv::imgproc::COLOR_BGR2RGB;
use opencv::imgproc::THRESH_BINARY;
use opencv::imgproc::THRESH_OTSU;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;

use super::PlateResult;
use crate::error::{PlateError, Result};
use crate::metrics;

pub const PLATE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Single-word page segmentation.
pub const DEFAULT_PAGE_SEG_MODE: u8 = 8;

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub data_path: Option<PathBuf>,
    pub lang: String,
    pub page_seg_mode: u8,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            lang: "eng".to_string(),
            page_seg_mode: DEFAULT_PAGE_SEG_MODE,
        }
    }
}

/// Turns a cropped plate image into raw text.
pub trait TextRecognizer: Send {
    /// Fails with `OcrUnavailable` when the engine cannot be reached.
    fn read_text(&mut self, image: &Mat) -> Result<String>;
}

fn ocr_unavailable<E: std::fmt::Debug>(context: &str) -> impl FnOnce(E) -> PlateError + '_ {
    move |e| PlateError::OcrUnavailable(format!("{}: {:?}", context, e))
}

/// In-process Tesseract through leptess.
pub struct DnnOcrReader {
    ocr: TessApi,
}

impl DnnOcrReader {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let data_path = config
            .data_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let mut api = tesseract::TessApi::new(data_path.as_deref(), &config.lang)
            .map_err(ocr_unavailable("cannot initialise tesseract"))?;

        let whitelist_key =
            CString::new("tessedit_char_whitelist").map_err(ocr_unavailable("whitelist"))?;
        let whitelist = CString::new(PLATE_ALPHABET).map_err(ocr_unavailable("whitelist"))?;
        api.raw
            .set_variable(&whitelist_key, &whitelist)
            .map_err(ocr_unavailable("cannot set whitelist"))?;

        let psm_key = CString::new("tessedit_pageseg_mode").map_err(ocr_unavailable("psm"))?;
        let psm =
            CString::new(config.page_seg_mode.to_string()).map_err(ocr_unavailable("psm"))?;
        api.raw
            .set_variable(&psm_key, &psm)
            .map_err(ocr_unavailable("cannot set page segmentation mode"))?;

        Ok(Self { ocr: api })
    }
}

unsafe impl Send for DnnOcrReader {}

impl TextRecognizer for DnnOcrReader {
    fn read_text(&mut self, image: &Mat) -> Result<String> {
        let channels = image.channels();
        let contiguous = if channels == 3 {
            let mut rgb = Mat::default();
            cvt_color(image, &mut rgb, COLOR_BGR2RGB, 0)?;
            rgb
        } else {
            image.try_clone()?
        };

        let cols = contiguous.cols();
        let rows = contiguous.rows();
        let bytes_per_line = cols * channels;
        let data = contiguous.data_bytes()?;
        self.ocr
            .raw
            .set_image(data, cols, rows, channels, bytes_per_line)
            .map_err(ocr_unavailable("cannot hand image to tesseract"))?;

        self.ocr
            .get_utf8_text()
            .map_err(ocr_unavailable("tesseract returned invalid text"))
    }
}

/// External `tesseract` process; the crop is piped in as PNG.
pub struct TesseractCommand {
    program: String,
    config: OcrConfig,
}

impl TesseractCommand {
    pub fn new(program: impl Into<String>, config: OcrConfig) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.config.lang.clone(),
            "--psm".to_string(),
            self.config.page_seg_mode.to_string(),
            "-c".to_string(),
            format!("tessedit_char_whitelist={}", PLATE_ALPHABET),
        ];
        if let Some(path) = &self.config.data_path {
            args.push("--tessdata-dir".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        args
    }
}

impl TextRecognizer for TesseractCommand {
    fn read_text(&mut self, image: &Mat) -> Result<String> {
        let mut png = Vector::<u8>::new();
        if !imencode(".png", image, &mut png, &Vector::new())? {
            return Err(PlateError::EncodeFailure("cannot encode plate crop".to_string()));
        }

        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ocr_unavailable(&self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&png.to_vec()) {
                drop(stdin);
                // Reap the child so a failed crop does not leave a zombie.
                let _ = child.kill();
                let _ = child.wait();
                return Err(PlateError::OcrUnavailable(format!(
                    "cannot write to tesseract: {}",
                    e
                )));
            }
        }
        let output = child
            .wait_with_output()
            .map_err(ocr_unavailable("tesseract did not finish"))?;

        if !output.status.success() {
            return Err(PlateError::OcrUnavailable(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Crops candidate boxes, prepares them for OCR and validates the text.
pub struct PlateReader {
    engine: Option<Box<dyn TextRecognizer>>,
    binarize: bool,
}

impl PlateReader {
    pub fn new(engine: Box<dyn TextRecognizer>, binarize: bool) -> Self {
        Self {
            engine: Some(engine),
            binarize,
        }
    }

    /// A reader whose engine failed to start; every call reports `OcrUnavailable`.
    pub fn unavailable(binarize: bool) -> Self {
        Self {
            engine: None,
            binarize,
        }
    }

    /// Returns the validated plate inside `bbox`, or `None` when the text does not match.
    pub fn recognize(&mut self, frame: &Mat, bbox: Rect) -> Result<Option<PlateResult>> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| PlateError::OcrUnavailable("no OCR engine configured".to_string()))?;

        let region = clip_to_frame(bbox, frame.cols(), frame.rows());
        if region.width <= 0 || region.height <= 0 {
            debug!("Skipping empty crop {:?}", bbox);
            return Ok(None);
        }

        let cropped = Mat::roi(frame, region)?.try_clone()?;
        let prepared = if self.binarize {
            binarize(&cropped)?
        } else {
            cropped
        };

        let text = engine.read_text(&prepared)?;
        let plate = PlateResult::parse(&text);
        if plate.is_none() {
            metrics::OCR_REJECTED.inc();
            warn!("Rejected plate text {:?}", text.trim());
        }
        Ok(plate)
    }
}

/// Grayscale conversion followed by Otsu thresholding.
pub fn binarize(image: &Mat) -> Result<Mat> {
    let gray = if image.channels() == 3 {
        let mut gray = Mat::default();
        cvt_color(image, &mut gray, COLOR_BGR2GRAY, 0)?;
        gray
    } else {
        image.try_clone()?
    };
    let mut binary = Mat::default();
    threshold(&gray, &mut binary, 0.0, 255.0, THRESH_BINARY | THRESH_OTSU)?;
    Ok(binary)
}

/// Intersection of `rect` with a `cols` x `rows` frame.
pub fn clip_to_frame(rect: Rect, cols: i32, rows: i32) -> Rect {
    let x1 = rect.x.clamp(0, cols);
    let y1 = rect.y.clamp(0, rows);
    let x2 = (rect.x + rect.width).clamp(0, cols);
    let y2 = (rect.y + rect.height).clamp(0, rows);
    Rect::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
}
