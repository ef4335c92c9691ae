//! MJPEG framing for the `/video_feed` endpoint.
//!
//! Every frame is sent as one part of a `multipart/x-mixed-replace` response.
//! Browsers replace the displayed image with each new part.

use std::convert::Infallible;

use bytes::{BufMut, Bytes, BytesMut};
use opencv::core::Vector;
use opencv::imgcodecs::imencode;
use opencv::imgcodecs::IMWRITE_JPEG_QUALITY;
use opencv::prelude::Mat;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::{PlateError, Result};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Debug, Clone)]
pub enum StreamPayload {
    /// A complete multipart chunk.
    Chunk(Bytes),
    /// The run failed; subscribers receive the message as a JSON body part.
    Error(String),
    /// The run ended.
    Closed,
}

/// A payload tagged with the run that produced it.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub generation: u64,
    pub payload: StreamPayload,
}

pub fn encode_jpeg(frame: &Mat, quality: i32) -> Result<Vec<u8>> {
    let mut buffer = Vector::<u8>::new();
    let params = Vector::<i32>::from_iter([IMWRITE_JPEG_QUALITY, quality]);
    let encoded = imencode(".jpg", frame, &mut buffer, &params)
        .map_err(|e| PlateError::EncodeFailure(e.to_string()))?;
    if !encoded {
        return Err(PlateError::EncodeFailure("imencode returned false".to_string()));
    }
    Ok(buffer.to_vec())
}

/// `--frame`, the part header, the JPEG bytes and a trailing CRLF.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    part("image/jpeg", jpeg)
}

/// A JSON part carrying `{"error": message}`, framed like the image parts.
pub fn error_chunk(message: &str) -> Bytes {
    part(
        "application/json",
        json!({ "error": message }).to_string().as_bytes(),
    )
}

fn part(content_type: &str, body: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: {}\r\n\r\n", BOUNDARY, content_type);
    let mut chunk = BytesMut::with_capacity(header.len() + body.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(body);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Body stream for one subscriber of run `generation`.
///
/// Ends when that run closes or a later run starts. Lagging subscribers skip frames.
pub fn subscriber_stream(
    generation: u64,
    rx: broadcast::Receiver<StreamEvent>,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
    BroadcastStream::new(rx)
        .filter_map(|event| event.ok())
        .take_while(move |event| {
            event.generation <= generation
                && !(event.generation == generation
                    && matches!(event.payload, StreamPayload::Closed))
        })
        .filter_map(move |event| {
            if event.generation != generation {
                return None;
            }
            match event.payload {
                StreamPayload::Chunk(chunk) => Some(Ok(chunk)),
                StreamPayload::Error(message) => Some(Ok(error_chunk(&message))),
                StreamPayload::Closed => None,
            }
        })
}
