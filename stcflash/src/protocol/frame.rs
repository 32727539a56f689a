//! STC ISP frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! +----------+--------+-----+-----------+----------+------+
//! |   Sync   | Length | CMD |  Payload  | Checksum | End  |
//! +----------+--------+-----+-----------+----------+------+
//! | 3 bytes  | 2 (BE) |  1  | variable  |  0/1/2   |  1   |
//! +----------+--------+-----+-----------+----------+------+
//! | 46 B9 6A |   n    | cmd |   data    |   sum    |  16  |
//! +----------+--------+-----+-----------+----------+------+
//! ```
//!
//! The host sends `46 B9 6A`, the device answers with `46 B9 68`. The length
//! `n` counts from the direction byte (`6A`/`68`) through the terminator. The
//! checksum is the additive sum of the direction byte, both length bytes, the
//! command and the payload; one byte wide it carries the low byte, two bytes
//! wide it carries high then low. Device frames never exceed 64 bytes.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::trace;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::port::{Port, read_exact_timeout};

/// Sync marker of host to device frames.
pub const HOST_SYNC: [u8; 3] = [0x46, 0xB9, 0x6A];

/// Sync marker of device to host frames.
pub const DEVICE_SYNC: [u8; 3] = [0x46, 0xB9, 0x68];

/// Frame terminator.
pub const TERMINATOR: u8 = 0x16;

/// Largest length field the device may announce.
pub const MAX_FRAME_LEN: usize = 64;

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Declared length exceeds [`MAX_FRAME_LEN`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The byte at the terminator position is not `0x16`.
    #[error("missing terminator, found {0:#04x}")]
    MissingTerminator(u8),

    /// Trailing checksum disagrees with the computed sum.
    #[error("checksum mismatch: computed {expected:#06x}, received {actual:#06x}")]
    ChecksumMismatch {
        /// Locally computed checksum.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// The frame does not start with the expected sync marker.
    #[error("bad sync marker")]
    BadSync,

    /// Fewer bytes than the declared length.
    #[error("truncated frame")]
    Truncated,
}

/// Width of the checksum trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ChecksumMode {
    /// No checksum (discovery only).
    #[default]
    None,
    /// Low byte of the sum.
    Byte,
    /// High and low byte of the sum.
    Word,
}

impl ChecksumMode {
    /// Number of checksum bytes on the wire.
    pub fn width(self) -> usize {
        match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Word => 2,
        }
    }

    /// Build from a byte width (0, 1 or 2).
    pub fn from_width(width: usize) -> Option<Self> {
        match width {
            0 => Some(Self::None),
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            _ => None,
        }
    }

    fn mask(self, sum: u32) -> u16 {
        match self {
            Self::None => 0,
            Self::Byte => (sum & 0xFF) as u16,
            Self::Word => (sum & 0xFFFF) as u16,
        }
    }
}

/// A command byte and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte.
    pub command: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Encode as a host to device frame.
    pub fn encode(&self, mode: ChecksumMode) -> Vec<u8> {
        encode(self.command, &self.payload, mode)
    }
}

fn additive_sum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .map(|&b| u32::from(b))
        .sum()
}

/// Encode a host to device frame.
///
/// Host frames are not bound by [`MAX_FRAME_LEN`]; flash chunks are larger.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode(command: u8, payload: &[u8], mode: ChecksumMode) -> Vec<u8> {
    let n = 1 + 2 + 1 + payload.len() + mode.width() + 1;
    let mut buf = Vec::with_capacity(n + 2);

    buf.extend_from_slice(&HOST_SYNC);
    buf.write_u16::<BigEndian>(n as u16)
        .unwrap();
    buf.push(command);
    buf.extend_from_slice(payload);

    let sum = additive_sum(&buf[2..]);
    match mode {
        ChecksumMode::None => {},
        ChecksumMode::Byte => buf.push((sum & 0xFF) as u8),
        ChecksumMode::Word => buf
            .write_u16::<BigEndian>(mode.mask(sum))
            .unwrap(),
    }
    buf.push(TERMINATOR);

    buf
}

/// Decode a complete device to host frame starting with [`DEVICE_SYNC`].
pub fn decode(raw: &[u8], mode: ChecksumMode) -> std::result::Result<Frame, FrameError> {
    if raw.len() < DEVICE_SYNC.len() {
        return Err(FrameError::Truncated);
    }
    if raw[..DEVICE_SYNC.len()] != DEVICE_SYNC {
        return Err(FrameError::BadSync);
    }
    decode_body(DEVICE_SYNC[2], &raw[DEVICE_SYNC.len()..], mode)
}

/// Decode a frame whose sync marker was already consumed.
///
/// `direction` is the last sync byte (it is part of the checksum), `body`
/// starts at the length field.
pub fn decode_body(
    direction: u8,
    body: &[u8],
    mode: ChecksumMode,
) -> std::result::Result<Frame, FrameError> {
    if body.len() < 2 {
        return Err(FrameError::Truncated);
    }

    let n = usize::from(BigEndian::read_u16(&body[..2]));
    if n > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge(n));
    }

    let width = mode.width();
    if n < 1 + 2 + 1 + width + 1 || body.len() < n - 1 {
        return Err(FrameError::Truncated);
    }

    // cmd, payload, checksum, terminator
    let rest = &body[2..n - 1];
    let last = rest[rest.len() - 1];
    if last != TERMINATOR {
        return Err(FrameError::MissingTerminator(last));
    }

    let data_end = rest.len() - 1 - width;
    if width > 0 {
        let sum = u32::from(direction) + additive_sum(&body[..2]) + additive_sum(&rest[..data_end]);
        let expected = mode.mask(sum);
        let trailer = &rest[data_end..rest.len() - 1];
        let actual = match mode {
            ChecksumMode::Word => BigEndian::read_u16(trailer),
            _ => u16::from(trailer[0]),
        };
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
    }

    Ok(Frame {
        command: rest[0],
        payload: rest[1..data_end].to_vec(),
    })
}

/// Receive one frame from the port.
///
/// Scans the input for `sync` until `timeout` elapses, then reads the length
/// field and the rest of the frame. Short reads after the sync marker are
/// reported as [`Error::Timeout`].
pub fn recv<P: Port + ?Sized>(
    port: &mut P,
    sync: &[u8],
    mode: ChecksumMode,
    timeout: Duration,
) -> Result<Frame> {
    let deadline = Instant::now() + timeout;
    let mut window: Vec<u8> = Vec::with_capacity(sync.len());

    loop {
        match read_exact_timeout(port, 1) {
            Ok(byte) => {
                window.push(byte[0]);
                if window.len() > sync.len() {
                    window.remove(0);
                }
                if window == sync {
                    break;
                }
            },
            Err(Error::Timeout(_)) => {},
            Err(e) => return Err(e),
        }

        if Instant::now() >= deadline {
            return Err(Error::Timeout("no frame received".into()));
        }
    }

    let mut body = read_exact_timeout(port, 2)?;
    let n = usize::from(BigEndian::read_u16(&body));
    if n > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge(n).into());
    }
    if n < 4 {
        return Err(FrameError::Truncated.into());
    }
    body.extend(read_exact_timeout(port, n - 3)?);

    let direction = sync[sync.len() - 1];
    let frame = decode_body(direction, &body, mode)?;
    trace!(
        "frame: cmd {:02X}, {} payload bytes",
        frame.command,
        frame
            .payload
            .len()
    );
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    /// Re-encode a host frame as if the device had sent it.
    fn as_device(mut raw: Vec<u8>, mode: ChecksumMode) -> Vec<u8> {
        raw[2] = DEVICE_SYNC[2];
        // The direction byte is part of the sum: 0x68 is 2 less than 0x6A.
        let end = raw.len() - 1;
        match mode {
            ChecksumMode::None => {},
            ChecksumMode::Byte => raw[end - 1] = raw[end - 1].wrapping_sub(2),
            ChecksumMode::Word => {
                let sum = BigEndian::read_u16(&raw[end - 2..end]).wrapping_sub(2);
                BigEndian::write_u16(&mut raw[end - 2..end], sum);
            },
        }
        raw
    }

    const MODES: [ChecksumMode; 3] = [ChecksumMode::None, ChecksumMode::Byte, ChecksumMode::Word];

    #[test]
    fn test_encode_layout() {
        let raw = encode(0x8F, &[0x01, 0x02], ChecksumMode::Byte);

        assert_eq!(&raw[..3], &HOST_SYNC);
        // n = 6A + len(2) + cmd + 2 payload + 1 checksum + terminator
        assert_eq!(&raw[3..5], &[0x00, 0x08]);
        assert_eq!(raw[5], 0x8F);
        let sum = 0x6Au32 + 0x08 + 0x8F + 0x01 + 0x02;
        assert_eq!(raw[8], (sum & 0xFF) as u8);
        assert_eq!(raw[9], TERMINATOR);
        assert_eq!(raw.len(), 10);
    }

    #[test]
    fn test_encode_word_checksum_high_then_low() {
        let raw = encode(0xFF, &[0xFF; 4], ChecksumMode::Word);
        let sum = 0x6Au32 + 0x0B + 0xFF * 5;
        let end = raw.len() - 1;
        assert_eq!(raw[end - 2], ((sum >> 8) & 0xFF) as u8);
        assert_eq!(raw[end - 1], (sum & 0xFF) as u8);
    }

    #[test]
    fn test_encode_empty_payload() {
        let raw = encode(0x82, &[], ChecksumMode::Byte);
        assert_eq!(raw, vec![0x46, 0xB9, 0x6A, 0x00, 0x06, 0x82, 0xF2, 0x16]);
    }

    #[test]
    fn test_round_trip_all_modes() {
        for mode in MODES {
            for len in [0usize, 1, 17, 57] {
                let payload: Vec<u8> = (0..len)
                    .map(|i| (i * 37 + 11) as u8)
                    .collect();
                let raw = as_device(encode(0xA5, &payload, mode), mode);
                let frame = decode(&raw, mode).unwrap();
                assert_eq!(frame, Frame::new(0xA5, payload.clone()), "mode {mode:?} len {len}");
            }
        }
    }

    #[test]
    fn test_bit_flip_in_payload_or_checksum_is_detected() {
        for mode in [ChecksumMode::Byte, ChecksumMode::Word] {
            let raw = as_device(encode(0x00, &[0x12, 0x34, 0x56, 0x78], mode), mode);
            let end = raw.len() - 1;
            // payload starts after sync(3) + len(2) + cmd(1)
            for pos in 6..end {
                for bit in 0..8 {
                    let mut corrupted = raw.clone();
                    corrupted[pos] ^= 1 << bit;
                    assert!(
                        matches!(
                            decode(&corrupted, mode),
                            Err(FrameError::ChecksumMismatch { .. })
                        ),
                        "mode {mode:?} pos {pos} bit {bit}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_decode_too_large() {
        let raw = [0x46, 0xB9, 0x68, 0x00, 0x41, 0x00, 0x16];
        assert_eq!(
            decode(&raw, ChecksumMode::None),
            Err(FrameError::FrameTooLarge(65))
        );
    }

    #[test]
    fn test_decode_missing_terminator() {
        let mut raw = as_device(encode(0x80, &[], ChecksumMode::Byte), ChecksumMode::Byte);
        let end = raw.len() - 1;
        raw[end] = 0x17;
        assert_eq!(
            decode(&raw, ChecksumMode::Byte),
            Err(FrameError::MissingTerminator(0x17))
        );
    }

    #[test]
    fn test_decode_bad_sync_and_truncated() {
        let raw = encode(0x80, &[], ChecksumMode::Byte);
        assert_eq!(decode(&raw, ChecksumMode::Byte), Err(FrameError::BadSync));

        let raw = as_device(raw, ChecksumMode::Byte);
        assert_eq!(
            decode(&raw[..raw.len() - 2], ChecksumMode::Byte),
            Err(FrameError::Truncated)
        );
    }

    #[test]
    fn test_checksum_mode_width() {
        for width in 0..3 {
            assert_eq!(
                ChecksumMode::from_width(width)
                    .unwrap()
                    .width(),
                width
            );
        }
        assert!(ChecksumMode::from_width(3).is_none());
    }

    #[test]
    fn test_recv_skips_noise_before_sync() {
        let mut port = MockPort::silent(9600);
        port.read_buf
            .extend([0x00, 0x46, 0x46]);
        port.read_buf
            .extend(&as_device(encode(0x80, &[0x07], ChecksumMode::Byte), ChecksumMode::Byte)[1..]);

        let frame = recv(&mut port, &DEVICE_SYNC, ChecksumMode::Byte, Duration::from_millis(10)).unwrap();
        assert_eq!(frame, Frame::new(0x80, vec![0x07]));
    }

    #[test]
    fn test_recv_timeout_without_data() {
        let mut port = MockPort::silent(9600);
        assert!(matches!(
            recv(&mut port, &DEVICE_SYNC, ChecksumMode::Byte, Duration::from_millis(5)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_recv_reports_checksum_error() {
        let mut raw = as_device(encode(0x80, &[0x07], ChecksumMode::Byte), ChecksumMode::Byte);
        raw[6] ^= 0x01;
        let mut port = MockPort::silent(9600);
        port.read_buf
            .extend(raw);

        assert!(matches!(
            recv(&mut port, &DEVICE_SYNC, ChecksumMode::Byte, Duration::from_millis(10)),
            Err(Error::Frame(FrameError::ChecksumMismatch { .. }))
        ));
    }
}
