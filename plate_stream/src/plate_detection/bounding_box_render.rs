use opencv::core::Point;
use opencv::core::Rect;
use opencv::core::Scalar;
use opencv::core::Size;
use opencv::imgproc::get_text_size;
use opencv::imgproc::put_text;
use opencv::imgproc::FONT_HERSHEY_SIMPLEX;
use opencv::imgproc::LINE_AA;
use opencv::imgproc::{rectangle, LineTypes};
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;

use crate::error::Result;

/// Gap between the label text and the edge of its background.
const LABEL_MARGIN: i32 = 3;

/// Draws plate boxes and their text onto frames.
pub struct BoundingBoxRender {
    pub color: Scalar,
    pub text_color: Scalar,
    pub thickness: i32,
}

impl Default for BoundingBoxRender {
    fn default() -> Self {
        Self {
            color: Scalar::from((0.0, 255.0, 0.0)),
            text_color: Scalar::from((225.0, 255.0, 255.0)),
            thickness: 2,
        }
    }
}

impl BoundingBoxRender {
    pub fn render(&self, image: &mut Mat, bbox: Rect, label: &str) -> Result<()> {
        rectangle(
            image,
            bbox,
            self.color,
            self.thickness,
            LineTypes::LINE_8 as i32,
            0,
        )?;

        let font_thickness = (self.thickness - 1).max(1);
        let font_scale = self.thickness as f64 / 3.0;
        let mut baseline = 0;
        let text_size = get_text_size(
            label,
            FONT_HERSHEY_SIMPLEX,
            font_scale,
            font_thickness,
            &mut baseline,
        )?;

        let header = label_rect(bbox, text_size, Size::new(image.cols(), image.rows()));
        rectangle(
            image,
            header,
            self.color,
            -1,
            LineTypes::LINE_8 as i32,
            0,
        )?;
        put_text(
            image,
            label,
            Point::new(header.x, header.y + header.height - LABEL_MARGIN + 1),
            FONT_HERSHEY_SIMPLEX,
            font_scale,
            self.text_color,
            font_thickness,
            LINE_AA,
            false,
        )?;
        Ok(())
    }
}

/// Label background placement: above the box's top-left corner, moved inside the box
/// when that would leave the frame, and shifted left to stay within the frame width.
pub fn label_rect(bbox: Rect, text: Size, frame: Size) -> Rect {
    let width = text.width.min(frame.width).max(0);
    let height = (text.height + LABEL_MARGIN).min(frame.height).max(0);

    let mut x = bbox.x;
    let mut y = bbox.y - height;
    if y < 0 {
        y = bbox.y;
    }
    if x + width > frame.width {
        x = frame.width - width;
    }
    if y + height > frame.height {
        y = frame.height - height;
    }

    Rect::new(x.max(0), y.max(0), width, height)
}
