//! 4-in-5 base85 coding for the SMS transport
//!
//! SMS messages can only carry printable characters, so the binary SM payload is
//! expanded four bytes into five characters drawn from the 85-character alphabet
//! `'!'..='u'`. Partial trailing groups encode n bytes as n+1 characters.

/// Offset of the first alphabet character
const EXCLAMATION: u8 = b'!';
/// Last valid alphabet character
const LAST: u8 = b'u';

/// Number of characters required to encode `bytes` binary bytes
pub(crate) fn encoded_len(bytes: usize) -> usize {
    (bytes / 4) * 5 + match bytes % 4 {
        0 => 0,
        rem => rem + 1,
    }
}

/// Upper bound on decoded size of `chars` encoded characters
pub(crate) fn decoded_len(chars: usize) -> usize {
    (chars / 5) * 4 + (chars % 5).saturating_sub(1)
}

/// Encode `src` into `dst`, returning the number of characters written
///
/// `dst` must hold at least `encoded_len(src.len())` bytes.
pub(crate) fn encode(dst: &mut [u8], src: &[u8]) -> usize {
    let mut out = 0;
    for chunk in src.chunks(4) {
        let mut group = [0u8; 4];
        group[..chunk.len()].copy_from_slice(chunk);
        let mut acc = u32::from_be_bytes(group);

        let mut digits = [0u8; 5];
        for d in digits.iter_mut().rev() {
            *d = (acc % 85) as u8 + EXCLAMATION;
            acc /= 85;
        }

        let take = if chunk.len() == 4 { 5 } else { chunk.len() + 1 };
        dst[out..out + take].copy_from_slice(&digits[..take]);
        out += take;
    }
    out
}

/// Decode `src` into `dst`, returning the number of bytes written
///
/// Returns `None` on characters outside the alphabet or an impossible trailing
/// group length. `dst` must hold at least `decoded_len(src.len())` bytes.
pub(crate) fn decode(dst: &mut [u8], src: &[u8]) -> Option<usize> {
    if src.len() % 5 == 1 {
        return None;
    }

    let mut out = 0;
    for chunk in src.chunks(5) {
        // Short groups borrow the largest digit for the positions they lack, which
        // makes truncation round-trip with the encoder's zero-padding.
        let mut digits = [LAST; 5];
        for (d, &c) in digits.iter_mut().zip(chunk) {
            if !(EXCLAMATION..=LAST).contains(&c) {
                return None;
            }
            *d = c;
        }

        let mut acc = 0u64;
        for d in digits {
            acc = acc * 85 + u64::from(d - EXCLAMATION);
        }
        if acc > u64::from(u32::MAX) {
            return None;
        }

        let bytes = (acc as u32).to_be_bytes();
        let take = if chunk.len() == 5 { 4 } else { chunk.len() - 1 };
        dst[out..out + take].copy_from_slice(&bytes[..take]);
        out += take;
    }
    Some(out)
}
