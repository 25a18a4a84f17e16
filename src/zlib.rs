//! Streaming payload compression
//!
//! Only raw deflate bytes travel on the wire: the sender strips the two-byte zlib
//! header from its output, and the receiver primes its inflate stream with the
//! synthetic header `0x58 0xC3` before feeding wire bytes. Decompression is
//! interleaved with segment arrival: one staging buffer's worth of output is handed
//! to the payload interpreter at a time, which bounds memory for large multi-segment
//! compressed payloads.

use flate2::{Compress, CompressError, Compression, Decompress, DecompressError, FlushCompress, FlushDecompress, Status};
use tracing::trace;

use crate::reassembly::PayloadBuffer;

/// Header presented to the inflater in place of the one stripped by the sender
pub(crate) const SYNTHETIC_ZLIB_HEADER: [u8; 2] = [0x58, 0xC3];

/// Number of leading bytes of a zlib stream not transmitted on the wire
pub(crate) const ZLIB_HEADER_BYTES: usize = 2;

/// Incremental inflater consuming one session's segments as they become available
#[derive(Debug)]
pub(crate) struct Inflater {
    z: Decompress,
    header_fed: usize,
    next_segment: u8,
    segment_offset: usize,
    out: Vec<u8>,
    out_len: usize,
    stream_end: bool,
}

impl Inflater {
    /// `chunk_bytes` sizes the staging buffer handed to the payload interpreter
    pub(crate) fn new(chunk_bytes: usize) -> Self {
        Inflater {
            z: Decompress::new(true),
            header_fed: 0,
            next_segment: 0,
            segment_offset: 0,
            out: vec![0; chunk_bytes.max(1)],
            out_len: 0,
            stream_end: false,
        }
    }

    /// Inflate into the staging buffer until it fills or input runs out
    ///
    /// Returns whether this chunk is the last one. The chunk is retained across
    /// calls so a busy consumer can retry without losing data; call
    /// [`Inflater::reset_chunk`] once the chunk has been accepted.
    pub(crate) fn step(&mut self, payload: &PayloadBuffer) -> Result<bool, DecompressError> {
        let count = payload.count().unwrap_or(0);
        let mut drained = false;
        while self.out_len < self.out.len() && !self.stream_end {
            let input: &[u8] = if self.header_fed < SYNTHETIC_ZLIB_HEADER.len() {
                &SYNTHETIC_ZLIB_HEADER[self.header_fed..]
            } else if self.next_segment < count {
                let segment = payload.segment(self.next_segment);
                if self.segment_offset >= segment.len() {
                    self.next_segment += 1;
                    self.segment_offset = 0;
                    continue;
                }
                &segment[self.segment_offset..]
            } else {
                // All wire input consumed; zlib may still hold pending output
                &[]
            };

            let before_in = self.z.total_in();
            let before_out = self.z.total_out();
            let status = self
                .z
                .decompress(input, &mut self.out[self.out_len..], FlushDecompress::None)?;
            let consumed = (self.z.total_in() - before_in) as usize;
            let produced = (self.z.total_out() - before_out) as usize;

            if self.header_fed < SYNTHETIC_ZLIB_HEADER.len() {
                self.header_fed += consumed;
            } else {
                self.segment_offset += consumed;
            }
            self.out_len += produced;

            match status {
                Status::StreamEnd => self.stream_end = true,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        // With wire input left this means the staging buffer must
                        // be emptied first; with none left the stream is spent
                        drained = input.is_empty();
                        break;
                    }
                }
            }
        }

        let last = self.stream_end || drained;
        trace!(chunk = self.out_len, last, "inflate step");
        Ok(last)
    }

    /// The currently staged output chunk
    pub(crate) fn chunk(&self) -> &[u8] {
        &self.out[..self.out_len]
    }

    /// Discard the staged chunk after the consumer has accepted it
    pub(crate) fn reset_chunk(&mut self) {
        self.out_len = 0;
    }
}

/// Compress `payload` into a complete zlib stream
///
/// The caller transmits the result starting at [`ZLIB_HEADER_BYTES`], dropping the
/// header the peer will substitute on its side.
pub(crate) fn deflate(payload: &[u8]) -> Result<Vec<u8>, CompressError> {
    // The peer inflates behind a synthetic header announcing an 8 KiB window, so
    // the stream must not use back-references beyond that
    let mut z = Compress::new_with_window_bits(Compression::default(), true, 13);
    let mut out = Vec::with_capacity(payload.len() / 2 + 64);
    let mut consumed = 0;
    loop {
        let before_in = z.total_in();
        let status = z.compress_vec(&payload[consumed..], &mut out, FlushCompress::Finish)?;
        consumed += (z.total_in() - before_in) as usize;
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => out.reserve(256),
        }
    }
}
