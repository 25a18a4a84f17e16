//! Infrastructure for writing wire fields
//!
//! All SM header fields the engine serializes byte-at-a-time go through these
//! helpers; the two-byte CRC is patched into place separately after it is computed
//! over the finished segment.

use bytes::BufMut;

/// Infallible encoding of a wire field
pub(crate) trait Codec {
    /// Append the encoding of `self` to `buf`
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

/// Convenience for encoding any `Codec` into a `BufMut`
pub(crate) trait BufMutExt {
    /// Append the encoding of `x` to the buffer
    fn write<T: Codec>(&mut self, x: T);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }
}
