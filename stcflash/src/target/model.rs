//! Model identification table.
//!
//! The boot loader reports a two byte model identifier. The first byte
//! selects a family entry, the second byte falls into one of the entry's
//! sub-ranges, and its offset into that range gives the ROM size.

use std::fmt;

use crate::error::{Error, Result};

/// Raw two byte model identifier reported by the boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(pub u8, pub u8);

impl ModelId {
    /// Identifier bytes in wire order.
    pub fn bytes(self) -> [u8; 2] {
        [self.0, self.1]
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.0, self.1)
    }
}

/// Result of a model lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ModelInfo {
    /// Marketing name, e.g. `STC89C52RC`.
    pub name: String,
    /// Program memory size in KB, `None` for unknown models.
    pub rom_size: Option<u16>,
}

/// Inclusive range over the second identifier byte.
struct ModelRange {
    lo: u8,
    hi: u8,
    infix: &'static str,
    postfix: &'static str,
}

struct ModelEntry {
    id: u8,
    family: &'static str,
    rom_ratio: u16,
    ranges: &'static [ModelRange],
}

macro_rules! ranges {
    ($(($lo:expr, $hi:expr) => ($infix:expr, $postfix:expr)),* $(,)?) => {
        &[$(ModelRange { lo: $lo, hi: $hi, infix: $infix, postfix: $postfix }),*]
    };
}

const MODEL_TABLE: &[ModelEntry] = &[
    ModelEntry {
        id: 0xE0,
        family: "12",
        rom_ratio: 1,
        ranges: ranges![
            (0x00, 0x1F) => ("C54", ""),
            (0x60, 0x7F) => ("C54", "AD"),
            (0x80, 0x9F) => ("LE54", ""),
            (0xE0, 0xFF) => ("LE54", "AD"),
        ],
    },
    ModelEntry {
        id: 0xE1,
        family: "12",
        rom_ratio: 1,
        ranges: ranges![
            (0x00, 0x1F) => ("C52", ""),
            (0x20, 0x3F) => ("C52", "PWM"),
            (0x60, 0x7F) => ("C52", "AD"),
            (0x80, 0x9F) => ("LE52", ""),
            (0xA0, 0xBF) => ("LE52", "PWM"),
            (0xE0, 0xFF) => ("LE52", "AD"),
        ],
    },
    ModelEntry {
        id: 0xE2,
        family: "11",
        rom_ratio: 1,
        ranges: ranges![
            (0x00, 0x1F) => ("F", ""),
            (0x20, 0x3F) => ("F", "E"),
            (0x70, 0x7F) => ("F", ""),
            (0x80, 0x9F) => ("L", ""),
            (0xA0, 0xBF) => ("L", "E"),
            (0xF0, 0xFF) => ("L", ""),
        ],
    },
    ModelEntry {
        id: 0xE6,
        family: "12",
        rom_ratio: 1,
        ranges: ranges![
            (0x00, 0x1F) => ("C56", ""),
            (0x60, 0x7F) => ("C56", "AD"),
            (0x80, 0x9F) => ("LE56", ""),
            (0xE0, 0xFF) => ("LE56", "AD"),
        ],
    },
    ModelEntry {
        id: 0xD1,
        family: "12",
        rom_ratio: 2,
        ranges: ranges![
            (0x20, 0x3F) => ("C5A", "CCP"),
            (0x40, 0x5F) => ("C5A", "AD"),
            (0x60, 0x7F) => ("C5A", "S2"),
            (0xA0, 0xBF) => ("LE5A", "CCP"),
            (0xC0, 0xDF) => ("LE5A", "AD"),
            (0xE0, 0xFF) => ("LE5A", "S2"),
        ],
    },
    ModelEntry {
        id: 0xD2,
        family: "10",
        rom_ratio: 1,
        ranges: ranges![
            (0x00, 0x0F) => ("F", ""),
            (0x60, 0x6F) => ("F", "XE"),
            (0x70, 0x7F) => ("F", "X"),
            (0xA0, 0xAF) => ("L", ""),
            (0xE0, 0xEF) => ("L", "XE"),
            (0xF0, 0xFF) => ("L", "X"),
        ],
    },
    ModelEntry {
        id: 0xD3,
        family: "11",
        rom_ratio: 2,
        ranges: ranges![
            (0x00, 0x1F) => ("F", ""),
            (0x40, 0x5F) => ("F", "X"),
            (0x60, 0x7F) => ("F", "XE"),
            (0xA0, 0xBF) => ("L", ""),
            (0xC0, 0xDF) => ("L", "X"),
            (0xE0, 0xFF) => ("L", "XE"),
        ],
    },
    ModelEntry {
        id: 0xF0,
        family: "89",
        rom_ratio: 4,
        ranges: ranges![
            (0x00, 0x10) => ("C5", "RC"),
            (0x20, 0x30) => ("C5", "RC"),
        ],
    },
    ModelEntry {
        id: 0xF1,
        family: "89",
        rom_ratio: 4,
        ranges: ranges![
            (0x00, 0x10) => ("C5", "RD+"),
            (0x20, 0x30) => ("C5", "RD+"),
        ],
    },
    ModelEntry {
        id: 0xF2,
        family: "12",
        rom_ratio: 1,
        ranges: ranges![
            (0x00, 0x0F) => ("C", "052"),
            (0x10, 0x1F) => ("C", "052AD"),
            (0x20, 0x2F) => ("LE", "052"),
            (0x30, 0x3F) => ("LE", "052AD"),
        ],
    },
];

/// Parts whose name carries the `IAP` prefix instead of `STC`.
const IAP_MODELS: &[ModelId] = &[
    ModelId(0xD1, 0x3F),
    ModelId(0xD1, 0x5F),
    ModelId(0xD1, 0x7F),
    ModelId(0xD2, 0x7E),
    ModelId(0xD2, 0xFE),
    ModelId(0xD3, 0x5F),
    ModelId(0xD3, 0xDF),
    ModelId(0xE2, 0x76),
    ModelId(0xE2, 0xF6),
];

/// ROM sizes that do not follow the range formula.
const ROM_OVERRIDES: &[(ModelId, u16)] = &[(ModelId(0xF0, 0x03), 13)];

/// Look up a model identifier.
///
/// Returns [`Error::UnknownModel`] when the first byte has no entry or the
/// second byte falls outside every range.
pub fn identify(id: ModelId) -> Result<ModelInfo> {
    let unknown = || Error::UnknownModel(id.0, id.1);

    let entry = MODEL_TABLE
        .iter()
        .find(|e| e.id == id.0)
        .ok_or_else(unknown)?;
    let range = entry
        .ranges
        .iter()
        .find(|r| (r.lo..=r.hi).contains(&id.1))
        .ok_or_else(unknown)?;

    let offset = u16::from(id.1 - range.lo);
    let rom_size = ROM_OVERRIDES
        .iter()
        .find(|(model, _)| *model == id)
        .map_or(entry.rom_ratio * offset, |(_, size)| *size);

    // STC90 parts share the STC89 identifiers in a narrow sub-band.
    let family = if matches!(id.0, 0xF0 | 0xF1) && (0x20..=0x30).contains(&id.1) {
        "90"
    } else {
        entry.family
    };

    let size_digits = match id.0 {
        0xF0 | 0xF1 => offset.to_string(),
        0xF2 => rom_size.to_string(),
        _ => format!("{rom_size:02}"),
    };

    let prefix = if IAP_MODELS.contains(&id) { "IAP" } else { "STC" };

    Ok(ModelInfo {
        name: format!(
            "{prefix}{family}{}{size_digits}{}",
            range.infix, range.postfix
        ),
        rom_size: Some(rom_size),
    })
}

/// Look up a model identifier, degrading to a placeholder for unknown parts.
pub fn identify_or_unknown(id: ModelId) -> ModelInfo {
    identify(id).unwrap_or_else(|_| ModelInfo {
        name: format!("Unknown {id}"),
        rom_size: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(id: ModelId, name: &str, rom: u16) {
        let info = identify(id).unwrap();
        assert_eq!(info.name, name, "model {id}");
        assert_eq!(info.rom_size, Some(rom), "model {id}");
    }

    #[test]
    fn test_identify_table() {
        check(ModelId(0xF0, 0x00), "STC89C50RC", 0);
        check(ModelId(0xF0, 0x02), "STC89C52RC", 8);
        check(ModelId(0xF0, 0x03), "STC89C53RC", 13);
        check(ModelId(0xF1, 0x04), "STC89C54RD+", 16);
        check(ModelId(0xF0, 0x22), "STC90C52RC", 8);
        check(ModelId(0xF1, 0x30), "STC90C516RD+", 64);
        check(ModelId(0xF2, 0x00), "STC12C0052", 0);
        check(ModelId(0xF2, 0x12), "STC12C2052AD", 2);
        check(ModelId(0xE1, 0x68), "STC12C5208AD", 8);
        check(ModelId(0xD1, 0x3E), "STC12C5A60CCP", 60);
        check(ModelId(0xD2, 0x05), "STC10F05", 5);
        check(ModelId(0xE6, 0x8C), "STC12LE5612", 12);
    }

    #[test]
    fn test_rom_override_beats_formula() {
        let info = identify(ModelId(0xF0, 0x03)).unwrap();
        assert_eq!(info.rom_size, Some(13));
        assert_ne!(info.rom_size, Some(4 * 3));
    }

    #[test]
    fn test_range_boundaries() {
        assert_eq!(
            identify(ModelId(0xF0, 0x10))
                .unwrap()
                .rom_size,
            Some(64)
        );
        assert!(identify(ModelId(0xF0, 0x11)).is_err());
        assert!(identify(ModelId(0xF0, 0x1F)).is_err());
        check(ModelId(0xF0, 0x20), "STC90C50RC", 0);
    }

    #[test]
    fn test_iap_prefix() {
        check(ModelId(0xD1, 0x3F), "IAP12C5A62CCP", 62);
        check(ModelId(0xE2, 0x76), "IAP11F06", 6);
        check(ModelId(0xD2, 0xFE), "IAP10L14X", 14);
    }

    #[test]
    fn test_unknown_first_byte() {
        assert!(matches!(
            identify(ModelId(0x99, 0x01)),
            Err(Error::UnknownModel(0x99, 0x01))
        ));

        let info = identify_or_unknown(ModelId(0x99, 0x01));
        assert!(info.name.starts_with("Unknown"));
        assert_eq!(info.name, "Unknown 99 01");
        assert_eq!(info.rom_size, None);
    }

    #[test]
    fn test_unknown_second_byte() {
        let info = identify_or_unknown(ModelId(0xE0, 0x30));
        assert_eq!(info.name, "Unknown E0 30");
        assert_eq!(info.rom_size, None);
    }

    #[test]
    fn test_model_id_display() {
        assert_eq!(ModelId(0xF2, 0x0A).to_string(), "F2 0A");
        assert_eq!(ModelId(0xF2, 0x0A).bytes(), [0xF2, 0x0A]);
    }
}
