//! Frame types shared by the capture, encode and streaming stages

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// One fully-encoded still image.
///
/// Backed by `Bytes`, so handing the same frame to many sessions only bumps a
/// reference count. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Encoded image bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("len", &self.data.len()).finish()
    }
}

impl From<Bytes> for Frame {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Memory layout of a raw pixel buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// R, G, B, A byte order (Android `RGBA_8888`)
    Rgba8888,
    /// R, G, B, padding byte
    Rgbx8888,
    /// B, G, R, A byte order (most desktop compositors)
    Bgra8888,
    /// Packed R, G, B
    Rgb888,
    /// Single luminance byte
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One raw buffer as delivered by the capture facility.
///
/// Owned by the producer for the duration of a single encode; dropping it
/// releases the buffer back to whoever allocated it.
#[derive(Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Bytes between the start of consecutive rows (>= width * bytes_per_pixel)
    pub stride: usize,
    pub format: PixelFormat,
}

impl RawFrame {
    /// Builds a tightly packed raw frame (stride == width * bytes_per_pixel)
    pub fn packed(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
        }
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Geometry and cadence of one capture session, fixed until the handle is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    /// Pixel density of the captured display (dpi)
    pub density: u32,
    pub frame_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shares_bytes() {
        let frame = Frame::new(Bytes::from_static(b"\xff\xd8jpeg\xff\xd9"));
        let clone = frame.clone();

        assert_eq!(frame.len(), 8);
        assert_eq!(frame.data().as_ptr(), clone.data().as_ptr());
    }

    #[test]
    fn test_packed_stride() {
        let raw = RawFrame::packed(vec![0u8; 4 * 3 * 2], 3, 2, PixelFormat::Rgba8888);
        assert_eq!(raw.stride, 12);

        let raw = RawFrame::packed(vec![0u8; 3 * 2], 3, 2, PixelFormat::Gray8);
        assert_eq!(raw.stride, 3);
    }
}
