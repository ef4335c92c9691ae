use opencv::core::copy_make_border;
use opencv::core::Rect;
use opencv::core::Scalar;
use opencv::core::Size;
use opencv::core::BORDER_CONSTANT;
use opencv::core::CV_32F;
use opencv::dnn::blob_from_image;
use opencv::imgproc::resize;
use opencv::imgproc::INTER_AREA;
use opencv::imgproc::INTER_LINEAR;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;

use crate::error::{PlateError, Result};

/// Gray used for the padded border, as the detector was trained with.
pub const PAD_VALUE: f64 = 114.0;

/// A frame scaled into a square detector input, with the geometry needed to map back.
pub struct Letterbox {
    /// `1x3xNxN` float blob, RGB, values in `[0, 1]`.
    pub tensor: Mat,
    pub input_size: i32,
    pub gain: f32,
    pub pad_x: i32,
    pub pad_y: i32,
    pub source: Size,
}

/// Scales `frame` so its longest side is `input_size`, pads it to a square and
/// converts it to a channel-first tensor.
pub fn letterbox(frame: &Mat, input_size: i32) -> Result<Letterbox> {
    let rows = frame.rows();
    let cols = frame.cols();
    if rows <= 0 || cols <= 0 || input_size <= 0 {
        return Err(PlateError::InvalidFrame(format!(
            "cannot letterbox {}x{} into {}",
            cols, rows, input_size
        )));
    }

    let gain = input_size as f32 / rows.max(cols) as f32;
    let new_cols = ((cols as f32 * gain).round() as i32).clamp(1, input_size);
    let new_rows = ((rows as f32 * gain).round() as i32).clamp(1, input_size);

    let mut resized = Mat::default();
    if new_cols == cols && new_rows == rows {
        resized = frame.try_clone()?;
    } else {
        let interpolation = if gain < 1.0 { INTER_AREA } else { INTER_LINEAR };
        resize(
            frame,
            &mut resized,
            Size::new(new_cols, new_rows),
            0.0,
            0.0,
            interpolation,
        )?;
    }

    let pad_x = (input_size - new_cols) / 2;
    let pad_y = (input_size - new_rows) / 2;
    let mut padded = Mat::default();
    copy_make_border(
        &resized,
        &mut padded,
        pad_y,
        input_size - new_rows - pad_y,
        pad_x,
        input_size - new_cols - pad_x,
        BORDER_CONSTANT,
        Scalar::all(PAD_VALUE),
    )?;

    let tensor = blob_from_image(
        &padded,
        1.0 / 255.0,
        Size::new(input_size, input_size),
        Scalar::default(),
        true,
        false,
        CV_32F,
    )?;

    Ok(Letterbox {
        tensor,
        input_size,
        gain,
        pad_x,
        pad_y,
        source: Size::new(cols, rows),
    })
}

impl Letterbox {
    /// Maps a point from tensor space into source frame pixels, clamped to the frame.
    pub fn restore_point(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = (x - self.pad_x as f32) / self.gain;
        let sy = (y - self.pad_y as f32) / self.gain;
        (
            sx.clamp(0.0, self.source.width as f32),
            sy.clamp(0.0, self.source.height as f32),
        )
    }

    /// Maps corner coordinates from tensor space into a rounded source frame rectangle.
    pub fn restore_box(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> Rect {
        let (left, top) = self.restore_point(x1, y1);
        let (right, bottom) = self.restore_point(x2, y2);
        let left = left.round() as i32;
        let top = top.round() as i32;
        Rect::new(
            left,
            top,
            (right.round() as i32 - left).max(0),
            (bottom.round() as i32 - top).max(0),
        )
    }
}
