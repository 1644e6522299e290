//! SDI-12 data CRC: CRC-16/ARC encoded as three printable ASCII bytes.

use crc::{Crc, CRC_16_ARC};

use crate::{CrcSnafu, Result};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub(crate) fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encode a CRC as three ASCII bytes carrying six bits each, MSB first,
/// OR'd with `0x40` so every byte lands in `0x40..=0x7F`.
pub(crate) fn encode_ascii(crc: u16) -> [u8; 3] {
    [
        0x40 | ((crc >> 12) & 0x3F) as u8,
        0x40 | ((crc >> 6) & 0x3F) as u8,
        0x40 | (crc & 0x3F) as u8,
    ]
}

pub(crate) fn decode_ascii(chars: [u8; 3]) -> u16 {
    (u16::from(chars[0] & 0x3F) << 12)
        | (u16::from(chars[1] & 0x3F) << 6)
        | u16::from(chars[2] & 0x3F)
}

/// Validate the trailing three-byte CRC of a response body (terminator
/// already stripped) and return the body without the CRC.
pub(crate) fn strip_verified(body: &[u8]) -> Result<&[u8]> {
    snafu::ensure!(body.len() > 3, CrcSnafu);
    let (payload, trailer) = body.split_at(body.len() - 3);
    let received = decode_ascii([trailer[0], trailer[1], trailer[2]]);
    snafu::ensure!(checksum(payload) == received, CrcSnafu);
    Ok(payload)
}
