//! `multipart/x-mixed-replace` framing
//!
//! Each frame goes out as
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JPEG>\r\n
//! ```
//!
//! Browsers render the stream natively with `<img src="/stream">`, replacing
//! the image on every part.

use crate::frame::Frame;
use bytes::Bytes;

pub const DEFAULT_BOUNDARY: &str = "frame";

/// Line break closing every part
pub const PART_TRAILER: &[u8] = b"\r\n";

/// Boundary parameter rules from RFC 2046: 1-70 characters out of a small
/// safe set, not ending in a space.
pub fn is_valid_boundary(boundary: &str) -> bool {
    const SPECIALS: &[u8] = b"'()+_,-./:=? ";

    !boundary.is_empty()
        && boundary.len() <= 70
        && !boundary.ends_with(' ')
        && boundary
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || SPECIALS.contains(&b))
}

/// Headers and part layout for one boundary token
#[derive(Debug, Clone)]
pub struct MultipartFormat {
    boundary: String,
}

impl MultipartFormat {
    /// The boundary is assumed valid; configuration checks it with
    /// [`is_valid_boundary`] before it gets here.
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// Boundary line plus the part headers, up to and including the blank line
    pub fn part_header(&self, content_length: usize) -> Bytes {
        Bytes::from(format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            self.boundary, content_length
        ))
    }

    pub fn part(&self, seq: u64, frame: Frame) -> FramePart {
        FramePart {
            seq,
            header: self.part_header(frame.len()),
            frame,
        }
    }
}

impl Default for MultipartFormat {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY)
    }
}

/// One frame ready to go out on the wire.
///
/// The frame body is shared, not copied: header, body and trailer are
/// written back to back.
#[derive(Debug, Clone)]
pub struct FramePart {
    pub seq: u64,
    pub header: Bytes,
    pub frame: Frame,
}

impl FramePart {
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.frame.len() + PART_TRAILER.len()
    }

    /// Header, body and trailer as separate body chunks, sharing the frame
    pub fn into_chunks(self) -> [Bytes; 3] {
        [
            self.header,
            self.frame.data().clone(),
            Bytes::from_static(PART_TRAILER),
        ]
    }

    /// Contiguous copy of the part, mostly useful for tests and logging
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(self.frame.data());
        out.extend_from_slice(PART_TRAILER);
        Bytes::from(out)
    }
}
