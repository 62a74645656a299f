//! Byte-buffer JPEG demuxer (§4.5 `FrameSlicer`).
//!
//! Consumes raw bytes as they arrive off a stream (e.g. an MJPEG HTTP body)
//! and emits each complete JPEG frame it finds, bounded by a trailing
//! retention window so an unbounded feed can't grow the buffer forever.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const TRAILING_WINDOW: usize = 64 * 1024;
const OVERFLOW_THRESHOLD: usize = 1024 * 1024;

/// Finds the last complete `SOI...EOI` JPEG frame in a growing buffer.
pub struct FrameSlicer {
    buf: Vec<u8>,
}

impl Default for FrameSlicer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlicer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append `chunk` and return the last complete JPEG frame found, if
    /// any. On a hit, the buffer retains only the trailing
    /// `TRAILING_WINDOW` bytes after the frame's end (in case the next
    /// frame's SOI is already buffered). With no hit, the buffer is
    /// truncated to its trailing window once it exceeds
    /// `OVERFLOW_THRESHOLD`, to bound memory on a feed with no valid
    /// frame boundaries.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let Some(start) = find_last(&self.buf, &SOI) else {
            self.truncate_if_overflowing();
            return None;
        };
        let Some(end) = find_last(&self.buf[start..], &EOI).map(|rel| start + rel) else {
            self.truncate_if_overflowing();
            return None;
        };

        let frame_end = end + EOI.len();
        let frame = self.buf[start..frame_end].to_vec();
        self.retain_trailing_window(frame_end);
        Some(frame)
    }

    /// After emitting a frame ending at `frame_end`, keep only what's left
    /// of the buffer from there on, capped to the trailing window in case
    /// a lot of bytes for the next frame already arrived.
    fn retain_trailing_window(&mut self, frame_end: usize) {
        self.buf.drain(..frame_end);
        if self.buf.len() > TRAILING_WINDOW {
            let from = self.buf.len() - TRAILING_WINDOW;
            self.buf.drain(..from);
        }
    }

    fn truncate_if_overflowing(&mut self) {
        if self.buf.len() > OVERFLOW_THRESHOLD {
            let from = self.buf.len() - TRAILING_WINDOW;
            self.buf.drain(..from);
        }
    }
}

fn find_last(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    if haystack.len() < 2 {
        return None;
    }
    (0..=haystack.len() - 2).rev().find(|&i| haystack[i] == needle[0] && haystack[i + 1] == needle[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = SOI.to_vec();
        frame.extend_from_slice(body);
        frame.extend_from_slice(&EOI);
        frame
    }

    #[test]
    fn emits_a_single_complete_frame() {
        let mut slicer = FrameSlicer::new();
        let frame = fake_jpeg(b"hello");
        let out = slicer.push(&frame);
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn no_emission_until_eoi_arrives() {
        let mut slicer = FrameSlicer::new();
        assert!(slicer.push(&SOI).is_none());
        assert!(slicer.push(b"body bytes").is_none());
        let out = slicer.push(&EOI);
        assert!(out.is_some());
        assert!(out.unwrap().ends_with(&EOI));
    }

    #[test]
    fn frames_arriving_split_across_pushes_are_reassembled() {
        let mut slicer = FrameSlicer::new();
        let frame = fake_jpeg(b"0123456789");
        let (first, second) = frame.split_at(frame.len() / 2);
        assert!(slicer.push(first).is_none());
        let out = slicer.push(second);
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn buffer_is_truncated_when_no_frame_boundary_ever_appears() {
        let mut slicer = FrameSlicer::new();
        let garbage = vec![0xAAu8; OVERFLOW_THRESHOLD + 1000];
        assert!(slicer.push(&garbage).is_none());
        assert!(slicer.buf.len() <= TRAILING_WINDOW);
    }

    #[test]
    fn picks_the_most_recent_frame_when_two_are_buffered() {
        let mut slicer = FrameSlicer::new();
        let first = fake_jpeg(b"first");
        let second = fake_jpeg(b"second");
        let mut both = first.clone();
        both.extend_from_slice(&second);
        let out = slicer.push(&both).unwrap();
        assert_eq!(out, second);
    }
}
