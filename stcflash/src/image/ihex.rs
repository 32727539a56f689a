//! Intel HEX decoding.
//!
//! Records are parsed with the `ihex` crate; this module lays the data
//! records out into one flat buffer, filling holes with `0xFF`.

use ihex::{ReaderError, Record};
use thiserror::Error;

/// Gap fill byte (erased flash).
const FILL: u8 = 0xFF;

/// Size of the 8051 code address space.
pub const ADDRESS_LIMIT: usize = 0x1_0000;

/// Intel HEX decoding errors. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    /// Record checksum does not sum to zero.
    #[error("checksum error on line {0}")]
    ChecksumError(usize),

    /// Bad start code, length, hex digits or record type.
    #[error("malformed record on line {0}")]
    MalformedRecord(usize),

    /// Data record ends past the 64 KB code space.
    #[error("data out of address range on line {0}")]
    AddressOutOfRange(usize),
}

/// Decode Intel HEX text into a flat image starting at address 0.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, HexError> {
    let mut image = Vec::new();
    let mut base = 0usize;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = Record::from_record_string(line).map_err(|e| match e {
            ReaderError::ChecksumMismatch(..) => HexError::ChecksumError(line_no),
            _ => HexError::MalformedRecord(line_no),
        })?;

        match record {
            Record::Data { offset, value } => {
                let start = base + usize::from(offset);
                let end = start + value.len();
                if end > ADDRESS_LIMIT {
                    return Err(HexError::AddressOutOfRange(line_no));
                }
                if image.len() < end {
                    image.resize(end, FILL);
                }
                image[start..end].copy_from_slice(&value);
            },
            Record::EndOfFile => break,
            Record::ExtendedSegmentAddress(segment) => base = usize::from(segment) << 4,
            Record::ExtendedLinearAddress(upper) => base = usize::from(upper) << 16,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {
                return Err(HexError::MalformedRecord(line_no));
            },
        }
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_is_filled() {
        let image = decode_hex(":02001000DEAD63\n:00000001FF\n").unwrap();

        assert_eq!(image.len(), 0x12);
        assert!(image[..0x10].iter().all(|&b| b == 0xFF));
        assert_eq!(&image[0x10..], &[0xDE, 0xAD]);
    }

    #[test]
    fn test_checksum_error_names_line() {
        assert_eq!(
            decode_hex(":00000001FF\r\n").unwrap(),
            Vec::<u8>::new()
        );
        assert_eq!(
            decode_hex(":0100000012ED\n:02001000DEAD64\n"),
            Err(HexError::ChecksumError(2))
        );
    }

    #[test]
    fn test_malformed_records() {
        assert_eq!(decode_hex("0100000012ED\n"), Err(HexError::MalformedRecord(1)));
        assert_eq!(
            decode_hex(":00000001FF\n:01000000ZZED\n"),
            Ok(Vec::new())
        );
        assert_eq!(
            decode_hex(":01000000ZZED\n"),
            Err(HexError::MalformedRecord(1))
        );
        // start segment address is not accepted
        assert_eq!(
            decode_hex(":0400000300003800C1\n"),
            Err(HexError::MalformedRecord(1))
        );
    }

    #[test]
    fn test_extended_segment_address() {
        // base 0x0010 << 4 = 0x100
        let image = decode_hex(":020000020010EC\n:0100000042BD\n:00000001FF\n").unwrap();
        assert_eq!(image.len(), 0x101);
        assert_eq!(image[0x100], 0x42);
    }

    #[test]
    fn test_data_past_code_space_is_rejected() {
        assert_eq!(
            decode_hex(":02000004FFFFFC\n:0100000042BD\n:00000001FF\n"),
            Err(HexError::AddressOutOfRange(2))
        );
        assert_eq!(
            decode_hex(":020000040100F9\n:0100000042BD\n:00000001FF\n"),
            Err(HexError::AddressOutOfRange(2))
        );
        assert_eq!(
            decode_hex(":02FFFF0042437B\n"),
            Err(HexError::AddressOutOfRange(1))
        );
    }

    #[test]
    fn test_last_code_byte_is_accepted() {
        let image = decode_hex(":01FFFF0042BF\n:00000001FF\n").unwrap();
        assert_eq!(image.len(), ADDRESS_LIMIT);
        assert_eq!(image[0xFFFF], 0x42);
    }

    #[test]
    fn test_overlapping_records_overwrite() {
        let image = decode_hex(":020000000102FB\n:0100010033CB\n").unwrap();
        assert_eq!(image, vec![0x01, 0x33]);
    }
}
