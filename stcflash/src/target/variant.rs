//! Protocol variants and their behaviour table.
//!
//! Every per-family difference of the boot loader protocol lives in a
//! [`VariantProfile`], resolved once when the variant becomes known.

use std::fmt;

use crate::error::{Error, Result};
use crate::port::Parity;
use crate::protocol::frame::ChecksumMode;
use crate::target::model::ModelId;

/// Boot loader protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ProtocolVariant {
    /// STC89/90 series.
    V89,
    /// STC12C5Ax, STC10Fx and STC11Fx series.
    V12C5A,
    /// STC12C52x and STC12C56x series.
    V12C52,
    /// STC12Cx052 series.
    V12Cx052,
}

/// A fixed command exchange of unknown purpose.
///
/// The payload is always `00 00 36 01` followed by the model identifier; the
/// device must answer with `reply` and an empty payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuirkExchange {
    /// Command byte sent to the device.
    pub command: u8,
    /// Command byte the device answers with.
    pub reply: u8,
    /// Number of times the exchange is repeated.
    pub repeat: usize,
}

impl QuirkExchange {
    /// Payload sent for the given model.
    pub fn payload(&self, model: ModelId) -> Vec<u8> {
        let mut payload = vec![0x00, 0x00, 0x36, 0x01];
        payload.extend_from_slice(&model.bytes());
        payload
    }
}

/// Shape of the erase command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseLayout {
    /// Constant magic payload.
    Magic,
    /// ROM size (in 256 byte pages) twice, padding and a countdown.
    RomSize,
}

/// Position of the "erase EEPROM on next download" flag in the info block.
///
/// The bit is cleared to request the erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromBit {
    /// Offset into the info block.
    pub offset: usize,
    /// Bit mask within that byte.
    pub mask: u8,
}

/// One piece of the option byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSegment {
    /// Info block bytes `start..end`.
    Info {
        /// First offset (inclusive).
        start: usize,
        /// Last offset (exclusive).
        end: usize,
    },
    /// A run of `0xFF` filler bytes.
    Fill(usize),
    /// Oscillator frequency in Hz, big-endian `u32`.
    Fosc,
}

/// Option byte layout of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionLayout {
    /// EEPROM erase flag location.
    pub eeprom: EepromBit,
    /// Payload pieces, in order.
    pub segments: &'static [OptionSegment],
}

impl OptionLayout {
    /// Smallest info block length the layout can be built from.
    pub fn required_len(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|s| match s {
                OptionSegment::Info { end, .. } => Some(*end),
                _ => None,
            })
            .chain(std::iter::once(self.eeprom.offset + 1))
            .max()
            .unwrap_or(0)
    }

    /// Build the option payload, `None` if `info` is too short.
    pub fn build(&self, info: &[u8], fosc_hz: u32) -> Option<Vec<u8>> {
        if info.len() < self.required_len() {
            return None;
        }

        let mut payload = Vec::new();
        for segment in self.segments {
            match *segment {
                OptionSegment::Info { start, end } => payload.extend_from_slice(&info[start..end]),
                OptionSegment::Fill(n) => payload.extend(std::iter::repeat_n(0xFF, n)),
                OptionSegment::Fosc => payload.extend_from_slice(&fosc_hz.to_be_bytes()),
            }
        }
        Some(payload)
    }
}

/// Behaviour table entry of a variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantProfile {
    /// Checksum width once the variant is known.
    pub checksum: ChecksumMode,
    /// UART parity.
    pub parity: Parity,
    /// Timer runs at half speed, doubling the divisor.
    pub double_divisor: bool,
    /// Descending FOSC thresholds (MHz) selecting the waiting time index.
    pub wait_thresholds: &'static [f64],
    /// Exchange sent before the baud handshake.
    pub pre_handshake: Option<QuirkExchange>,
    /// Exchange sent after the baud handshake.
    pub post_handshake: Option<QuirkExchange>,
    /// Exchange sent after the last flash chunk.
    pub post_flash: Option<QuirkExchange>,
    /// Erase payload shape.
    pub erase: EraseLayout,
    /// Command byte the erase reply must carry.
    pub erase_reply: u8,
    /// Option byte layout, `None` if unknown.
    pub options: Option<OptionLayout>,
}

const WAIT_89: &[f64] = &[40.0, 20.0, 10.0, 5.0];
const WAIT_12: &[f64] = &[30.0, 24.0, 20.0, 12.0, 6.0, 3.0, 2.0, 1.0];

const QUIRK_50: QuirkExchange = QuirkExchange {
    command: 0x50,
    reply: 0x8F,
    repeat: 1,
};
const QUIRK_80: QuirkExchange = QuirkExchange {
    command: 0x80,
    reply: 0x80,
    repeat: 5,
};
const QUIRK_69: QuirkExchange = QuirkExchange {
    command: 0x69,
    reply: 0x8D,
    repeat: 1,
};

const OPTIONS_89: OptionLayout = OptionLayout {
    eeprom: EepromBit {
        offset: 2,
        mask: 0x08,
    },
    segments: &[
        OptionSegment::Info { start: 2, end: 3 },
        OptionSegment::Fill(3),
    ],
};

const OPTIONS_12C5A: OptionLayout = OptionLayout {
    eeprom: EepromBit {
        offset: 6,
        mask: 0x08,
    },
    segments: &[
        OptionSegment::Info { start: 6, end: 9 },
        OptionSegment::Fill(5),
        OptionSegment::Info { start: 10, end: 11 },
        OptionSegment::Fill(6),
        OptionSegment::Fosc,
    ],
};

const OPTIONS_12C52: OptionLayout = OptionLayout {
    eeprom: EepromBit {
        offset: 8,
        mask: 0x02,
    },
    segments: &[
        OptionSegment::Info { start: 6, end: 11 },
        OptionSegment::Fosc,
        OptionSegment::Info { start: 12, end: 16 },
        OptionSegment::Fill(4),
        OptionSegment::Info { start: 8, end: 9 },
        OptionSegment::Fill(7),
        OptionSegment::Fosc,
        OptionSegment::Fill(3),
    ],
};

const PROFILE_89: VariantProfile = VariantProfile {
    checksum: ChecksumMode::Byte,
    parity: Parity::None,
    double_divisor: false,
    wait_thresholds: WAIT_89,
    pre_handshake: None,
    post_handshake: Some(QUIRK_80),
    post_flash: None,
    erase: EraseLayout::Magic,
    erase_reply: 0x80,
    options: Some(OPTIONS_89),
};

const PROFILE_12C5A: VariantProfile = VariantProfile {
    checksum: ChecksumMode::Word,
    parity: Parity::Even,
    double_divisor: true,
    wait_thresholds: WAIT_12,
    pre_handshake: Some(QUIRK_50),
    post_handshake: None,
    post_flash: Some(QUIRK_69),
    erase: EraseLayout::RomSize,
    erase_reply: 0x00,
    options: Some(OPTIONS_12C5A),
};

const PROFILE_12C52: VariantProfile = VariantProfile {
    options: Some(OPTIONS_12C52),
    ..PROFILE_12C5A
};

const PROFILE_12CX052: VariantProfile = VariantProfile {
    checksum: ChecksumMode::Byte,
    parity: Parity::None,
    double_divisor: true,
    wait_thresholds: WAIT_12,
    pre_handshake: None,
    post_handshake: Some(QUIRK_80),
    post_flash: None,
    erase: EraseLayout::RomSize,
    erase_reply: 0x80,
    options: Some(OPTIONS_12C52),
};

impl ProtocolVariant {
    /// All variants.
    pub const ALL: [Self; 4] = [Self::V89, Self::V12C5A, Self::V12C52, Self::V12Cx052];

    /// Behaviour table entry.
    pub fn profile(self) -> &'static VariantProfile {
        match self {
            Self::V89 => &PROFILE_89,
            Self::V12C5A => &PROFILE_12C5A,
            Self::V12C52 => &PROFILE_12C52,
            Self::V12Cx052 => &PROFILE_12CX052,
        }
    }

    /// Resolve the variant from the first model identifier byte.
    pub fn from_model(model: ModelId) -> Option<Self> {
        match model.0 {
            0xF0 | 0xF1 => Some(Self::V89),
            0xF2 => Some(Self::V12Cx052),
            0xD1 | 0xD2 | 0xE2 => Some(Self::V12C5A),
            0xE1 | 0xE6 => Some(Self::V12C52),
            _ => None,
        }
    }

    /// Parse a protocol name as accepted on the command line.
    ///
    /// `auto` is not a variant and returns `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "89" => Some(Self::V89),
            "12" | "12c5a" => Some(Self::V12C5A),
            "12c52" => Some(Self::V12C52),
            "12cx052" => Some(Self::V12Cx052),
            _ => None,
        }
    }

    /// Short protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::V89 => "89",
            Self::V12C5A => "12c5a",
            Self::V12C52 => "12c52",
            Self::V12Cx052 => "12cx052",
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl VariantProfile {
    /// Waiting time index for the given oscillator frequency.
    ///
    /// First threshold the frequency exceeds, or the last index.
    pub fn wait_index(&self, fosc_mhz: f64) -> u8 {
        let last = self.wait_thresholds.len().saturating_sub(1);
        self.wait_thresholds
            .iter()
            .position(|&threshold| fosc_mhz > threshold)
            .unwrap_or(last) as u8
    }

    /// Build the erase payload.
    pub fn erase_payload(&self, rom_size: Option<u16>) -> Result<Vec<u8>> {
        match self.erase {
            EraseLayout::Magic => Ok(vec![0x01, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33]),
            EraseLayout::RomSize => {
                let rom = rom_size
                    .ok_or_else(|| Error::Unsupported("ROM size of this model is unknown".into()))?;
                let pages = u8::try_from(rom * 4)
                    .map_err(|_| Error::Unsupported(format!("ROM size {rom}KB is out of range")))?;

                let mut payload = vec![0x00, 0x00, pages, 0x00, 0x00, pages];
                payload.extend(std::iter::repeat_n(0x00, 12));
                payload.extend((0x0Eu8..=0x80).rev());
                Ok(payload)
            },
        }
    }
}
