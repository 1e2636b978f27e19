//! Raw pixel buffer to JPEG

use crate::frame::{Frame, PixelFormat, RawFrame};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageBuffer, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("invalid buffer layout: {0}")]
    InvalidLayout(String),

    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Turns one raw buffer into one encoded frame.
///
/// Implementations must not keep any reference to `raw` after returning.
pub trait FrameEncoder: Send {
    fn encode(&mut self, raw: &RawFrame) -> Result<Frame, EncodeError>;
}

/// Baseline JPEG encoder with a fixed quality
#[derive(Debug, Clone)]
pub struct JpegFrameEncoder {
    quality: u8,
    // Reused between frames to avoid a fresh allocation per encode
    scratch: Vec<u8>,
}

impl JpegFrameEncoder {
    /// `quality` is clamped to 1..=100
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            scratch: Vec::new(),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, raw: &RawFrame) -> Result<Frame, EncodeError> {
        check_layout(raw)?;

        let mut out = Vec::with_capacity(raw.width as usize * raw.height as usize / 4);
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality);

            if raw.format == PixelFormat::Gray8 {
                pack_rows(raw, &mut self.scratch);
                let img: GrayImage =
                    ImageBuffer::from_raw(raw.width, raw.height, std::mem::take(&mut self.scratch))
                        .ok_or_else(|| EncodeError::InvalidLayout("gray buffer too small".into()))?;
                let result = encoder.encode_image(&img);
                self.scratch = img.into_raw();
                result?;
            } else {
                to_rgb(raw, &mut self.scratch);
                let img: RgbImage =
                    ImageBuffer::from_raw(raw.width, raw.height, std::mem::take(&mut self.scratch))
                        .ok_or_else(|| EncodeError::InvalidLayout("rgb buffer too small".into()))?;
                let result = encoder.encode_image(&img);
                self.scratch = img.into_raw();
                result?;
            }
        }

        Ok(Frame::new(Bytes::from(out)))
    }
}

fn check_layout(raw: &RawFrame) -> Result<(), EncodeError> {
    if raw.width == 0 || raw.height == 0 {
        return Err(EncodeError::InvalidLayout(format!(
            "empty frame {}x{}",
            raw.width, raw.height
        )));
    }

    let row_bytes = (raw.width as usize)
        .checked_mul(raw.format.bytes_per_pixel())
        .ok_or_else(|| EncodeError::InvalidLayout(format!("row of {} pixels overflows", raw.width)))?;
    if raw.stride < row_bytes {
        return Err(EncodeError::InvalidLayout(format!(
            "stride {} shorter than row of {} bytes",
            raw.stride, row_bytes
        )));
    }

    // The last row does not need its padding
    let needed = raw
        .stride
        .checked_mul(raw.height as usize - 1)
        .and_then(|padded| padded.checked_add(row_bytes))
        .ok_or_else(|| {
            EncodeError::InvalidLayout(format!(
                "stride {} over {} rows overflows",
                raw.stride, raw.height
            ))
        })?;
    if raw.data.len() < needed {
        return Err(EncodeError::InvalidLayout(format!(
            "buffer holds {} bytes, {}x{} stride {} needs {}",
            raw.data.len(),
            raw.width,
            raw.height,
            raw.stride,
            needed
        )));
    }

    Ok(())
}

fn rows(raw: &RawFrame) -> impl Iterator<Item = &[u8]> {
    let row_bytes = raw.width as usize * raw.format.bytes_per_pixel();
    (0..raw.height as usize).map(move |y| {
        let start = y * raw.stride;
        &raw.data[start..start + row_bytes]
    })
}

fn pack_rows(raw: &RawFrame, out: &mut Vec<u8>) {
    out.clear();
    for row in rows(raw) {
        out.extend_from_slice(row);
    }
}

fn to_rgb(raw: &RawFrame, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(raw.width as usize * raw.height as usize * 3);

    for row in rows(raw) {
        match raw.format {
            PixelFormat::Rgb888 => out.extend_from_slice(row),
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
            }
            PixelFormat::Bgra8888 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            PixelFormat::Gray8 => {
                for &l in row {
                    out.extend_from_slice(&[l, l, l]);
                }
            }
        }
    }
}
