pub mod bounding_box_render;
pub mod dnn_ocr;
pub mod letterbox;
pub mod object_detector;
pub mod video_reader;

use serde::Serialize;
use std::fmt;

const PLATE_LETTERS: usize = 3;
const PLATE_DIGITS: usize = 4;

/// True when `text`, uppercased, is exactly three letters followed by four digits.
pub fn is_valid_plate(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    bytes.len() == PLATE_LETTERS + PLATE_DIGITS
        && bytes[..PLATE_LETTERS].iter().all(u8::is_ascii_uppercase)
        && bytes[PLATE_LETTERS..].iter().all(u8::is_ascii_digit)
}

/// A plate string that passed validation, always stored uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PlateResult(String);

impl PlateResult {
    /// Trims and uppercases raw OCR output, keeping it only if it is a valid plate.
    pub fn parse(raw: &str) -> Option<Self> {
        let text = raw.trim();
        if is_valid_plate(text) {
            Some(Self(text.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
