//! JPEG frame boundary detection for concatenated MJPEG byte streams.
//!
//! The transcoder writes back-to-back JPEG images to stdout with no framing.
//! Frames are cut at SOI (`FF D8`) / EOI (`FF D9`) markers. Bytes that follow an
//! EOI stay buffered for the next frame.

use bytes::Bytes;

/// Upper bound for a single encoded frame.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Incremental splitter fed with arbitrary stdout chunks.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buffer: Vec<u8>,
    discarded_bytes: u64,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            discarded_bytes: 0,
        }
    }

    /// Append a chunk read from the byte stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() > MAX_JPEG_BYTES && find_jpeg_bounds(&self.buffer).is_none() {
            // Keep the last byte: it may be the 0xFF half of a split marker.
            let keep = 1.min(self.buffer.len());
            let drain_len = self.buffer.len() - keep;
            self.buffer.drain(..drain_len);
            self.discarded_bytes += drain_len as u64;
            log::warn!(
                "mjpeg: no complete frame within {} bytes, discarded buffer",
                drain_len
            );
        }
    }

    /// Pop the next complete JPEG, if one is buffered.
    pub fn next_jpeg(&mut self) -> Option<Bytes> {
        let (start, end) = find_jpeg_bounds(&self.buffer)?;
        if start > 0 {
            self.discarded_bytes += start as u64;
        }
        let frame = Bytes::copy_from_slice(&self.buffer[start..end]);
        self.buffer.drain(..end);
        Some(frame)
    }

    /// Bytes currently waiting for a frame boundary.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Garbage bytes skipped outside of any frame.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut j = start + 2;
    while j + 1 < buffer.len() {
        if buffer[j] == 0xFF && buffer[j + 1] == 0xD9 {
            return Some((start, j + 2));
        }
        j += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        out.extend_from_slice(body);
        out.extend_from_slice(&[0xFF, 0xD9]);
        out
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut stream = jpeg(b"one");
        stream.extend(jpeg(b"two"));
        let mut splitter = JpegSplitter::new();
        splitter.push(&stream);

        assert_eq!(splitter.next_jpeg().as_deref(), Some(&jpeg(b"one")[..]));
        assert_eq!(splitter.next_jpeg().as_deref(), Some(&jpeg(b"two")[..]));
        assert!(splitter.next_jpeg().is_none());
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn keeps_trailing_bytes_for_next_frame() {
        let first = jpeg(b"first");
        let second = jpeg(b"second");
        let mut stream = first.clone();
        stream.extend_from_slice(&second[..4]);

        let mut splitter = JpegSplitter::new();
        splitter.push(&stream);
        assert_eq!(splitter.next_jpeg().as_deref(), Some(&first[..]));
        assert!(splitter.next_jpeg().is_none());

        splitter.push(&second[4..]);
        assert_eq!(splitter.next_jpeg().as_deref(), Some(&second[..]));
    }

    #[test]
    fn handles_marker_split_across_chunks() {
        let frame = jpeg(b"abc");
        let (head, tail) = frame.split_at(frame.len() - 1);

        let mut splitter = JpegSplitter::new();
        splitter.push(head);
        assert!(splitter.next_jpeg().is_none());
        splitter.push(tail);
        assert_eq!(splitter.next_jpeg().as_deref(), Some(&frame[..]));
    }

    #[test]
    fn skips_leading_garbage() {
        let mut stream = b"noise".to_vec();
        stream.extend(jpeg(b"x"));
        let mut splitter = JpegSplitter::new();
        splitter.push(&stream);
        assert_eq!(splitter.next_jpeg().as_deref(), Some(&jpeg(b"x")[..]));
        assert_eq!(splitter.discarded_bytes(), 5);
    }

    #[test]
    fn oversized_partial_frame_is_discarded() {
        let mut splitter = JpegSplitter::new();
        splitter.push(&[0xFF, 0xD8]);
        splitter.push(&vec![0u8; MAX_JPEG_BYTES - 2]);
        assert_eq!(splitter.buffered(), MAX_JPEG_BYTES);

        splitter.push(&[0u8]);
        assert_eq!(splitter.buffered(), 1);
        assert!(splitter.next_jpeg().is_none());

        splitter.push(&jpeg(b"ok"));
        assert_eq!(splitter.next_jpeg().as_deref(), Some(&jpeg(b"ok")[..]));
    }
}
