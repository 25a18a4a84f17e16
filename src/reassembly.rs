//! Per-session payload accumulation
//!
//! Multipart payloads are reassembled into a single allocation laid out by a fixed
//! per-segment stride (the transport's maximum payload size), not by actual segment
//! sizes; the sizes received so far are recorded separately per segment.
//! Reassembly completes exactly when every segment of the announced count
//! has arrived. Segments may arrive in any order and duplicates are discarded
//! without error.

use tracing::debug;

/// Result of offering a segment to the buffer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Insert {
    /// Newly received segment recorded
    Accepted,
    /// Segment already present; ignored
    Duplicate,
    /// Segment number out of range for this session
    OutOfRange,
}

/// Reassembled (possibly still partial) inbound payload of one session
#[derive(Debug)]
pub(crate) struct PayloadBuffer {
    buf: Vec<u8>,
    /// Actual bytes received per segment
    sizes: Vec<u16>,
    /// Which segments have arrived; a size of zero alone cannot distinguish an
    /// empty segment from an absent one
    seen: Vec<bool>,
    /// Total segment count, known once segment 0 arrives
    count: Option<u8>,
    received: u8,
    stride: usize,
}

impl PayloadBuffer {
    /// Buffer for a payload that arrived whole in one segment
    pub(crate) fn single(data: Vec<u8>) -> Self {
        let len = data.len();
        PayloadBuffer {
            stride: len,
            sizes: vec![len as u16],
            seen: vec![true],
            count: Some(1),
            received: 1,
            buf: data,
        }
    }

    /// Empty buffer reserving room for up to `max_segments` segments of `stride` bytes
    ///
    /// The real count is learned from segment 0, which may not arrive first.
    pub(crate) fn multipart(max_segments: u8, stride: usize) -> Self {
        PayloadBuffer {
            buf: vec![0; usize::from(max_segments) * stride],
            sizes: vec![0; usize::from(max_segments)],
            seen: vec![false; usize::from(max_segments)],
            count: None,
            received: 0,
            stride,
        }
    }

    /// Record the total segment count announced by segment 0
    pub(crate) fn set_count(&mut self, count: u8) {
        // Duplicate segment 0 must not reset progress
        if self.count.is_none() {
            self.count = Some(count);
        }
    }

    /// Offer the payload bytes of segment `number`
    pub(crate) fn insert(&mut self, number: u8, data: &[u8]) -> Insert {
        let idx = usize::from(number);
        if idx >= self.sizes.len()
            || data.len() > self.stride
            || self.count.is_some_and(|c| number >= c)
        {
            return Insert::OutOfRange;
        }
        if self.seen[idx] {
            debug!(segment = number, "duplicate segment, discarding");
            return Insert::Duplicate;
        }
        self.buf[idx * self.stride..idx * self.stride + data.len()].copy_from_slice(data);
        self.sizes[idx] = data.len() as u16;
        self.seen[idx] = true;
        self.received += 1;
        Insert::Accepted
    }

    /// Whether every announced segment has arrived
    pub(crate) fn complete(&self) -> bool {
        self.count.map_or(false, |c| self.received >= c)
    }

    /// Number of segments in the complete payload, if known
    pub(crate) fn count(&self) -> Option<u8> {
        self.count
    }

    /// Payload bytes of segment `idx`
    pub(crate) fn segment(&self, idx: u8) -> &[u8] {
        let i = usize::from(idx);
        &self.buf[i * self.stride..i * self.stride + usize::from(self.sizes[i])]
    }

    /// Total payload bytes across all received segments
    pub(crate) fn len(&self) -> usize {
        self.sizes.iter().map(|&s| usize::from(s)).sum()
    }

    #[cfg(test)]
    pub(crate) fn contiguous(&self) -> Vec<u8> {
        let count = self.count.expect("incomplete payload");
        let mut out = Vec::with_capacity(self.len());
        for i in 0..count {
            out.extend_from_slice(self.segment(i));
        }
        out
    }
}
