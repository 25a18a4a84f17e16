//! Segment checksum
//!
//! Every SM segment carries a CRC-16 computed over the segment's header and payload
//! with the header's own CRC field forced to zero. The parameters are a fixed
//! interoperability contract with the cloud service: polynomial 0x1021, initial
//! value 0x0000, no bit reflection, no final xor (the XMODEM variant).

use crc::{Algorithm, Crc};

/// Legacy SM checksum parameters. Do not "upgrade"; the peer implements exactly this.
const SM_CRC16: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x0000,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x31C3,
    residue: 0x0000,
};

const CRC: Crc<u16> = Crc::<u16>::new(&SM_CRC16);

/// Compute the SM checksum of `data`
pub(crate) fn compute(data: &[u8]) -> u16 {
    CRC.checksum(data)
}
