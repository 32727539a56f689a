//! Per-device session state.

use std::fmt;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::port::hex_string;
use crate::protocol::frame::ChecksumMode;
use crate::target::model::{ModelId, identify_or_unknown};
use crate::target::variant::ProtocolVariant;

/// Number of clock sample bytes leading the discovery payload.
const SAMPLE_LEN: usize = 16;

/// Sample count to MHz scaling at 1 baud.
const FOSC_DIVISOR: f64 = 580_974.0;

/// Smallest info block that still carries the model identifier.
const MIN_INFO_LEN: usize = 5;

/// Boot loader firmware version, e.g. `4.3C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Major version (high nibble).
    pub major: u8,
    /// Minor version (low nibble).
    pub minor: u8,
    /// Revision letter.
    pub revision: char,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.major, self.minor, self.revision)
    }
}

/// Device information block returned during discovery.
///
/// Option bytes are modified in place before they are written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoBlock(Vec<u8>);

impl InfoBlock {
    /// Wrap raw info bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0
            .len()
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.0
            .is_empty()
    }

    /// Boot loader version (bytes 0 and 1).
    pub fn version(&self) -> FirmwareVersion {
        FirmwareVersion {
            major: self.0[0] >> 4,
            minor: self.0[0] & 0x0F,
            revision: char::from(self.0[1]),
        }
    }

    /// Model identifier (bytes 3 and 4).
    pub fn model(&self) -> ModelId {
        ModelId(self.0[3], self.0[4])
    }

    /// Set or clear the bits of `mask` at `offset`.
    ///
    /// Returns `false` if `offset` is out of range.
    pub fn set_bits(&mut self, offset: usize, mask: u8, set: bool) -> bool {
        let Some(byte) = self
            .0
            .get_mut(offset)
        else {
            return false;
        };
        if set {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        true
    }

    /// Drop the trailing checksum bytes a discovery frame carries.
    pub fn strip_checksum(&mut self, width: usize) {
        let len = self
            .0
            .len()
            .saturating_sub(width);
        self.0
            .truncate(len);
    }
}

/// Everything learned about the attached device.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    /// Oscillator frequency in MHz.
    pub fosc: f64,
    /// Device information block.
    pub info: InfoBlock,
    /// Boot loader version.
    pub version: FirmwareVersion,
    /// Raw model identifier.
    pub model: ModelId,
    /// Model name, `Unknown XX XX` for parts outside the table.
    pub name: String,
    /// Program memory size in KB.
    pub rom_size: Option<u16>,
    /// Resolved protocol variant.
    pub variant: Option<ProtocolVariant>,
    /// Checksum width in effect.
    pub checksum: ChecksumMode,
    /// Baud rate discovery ran at.
    pub detect_baud: u32,
    /// Negotiated baud rate.
    pub baud: Option<u32>,
}

/// Oscillator frequency (MHz) from the discovery clock samples.
///
/// Even sample bytes are high bytes, odd sample bytes low bytes.
pub fn fosc_from_samples(samples: &[u8], baud: u32) -> f64 {
    let high: u32 = samples
        .iter()
        .step_by(2)
        .map(|&b| u32::from(b))
        .sum();
    let low: u32 = samples
        .iter()
        .skip(1)
        .step_by(2)
        .map(|&b| u32::from(b))
        .sum();
    let count = f64::from(high * 256 + low) / 8.0;
    count * f64::from(baud) / FOSC_DIVISOR
}

impl DeviceSession {
    /// Parse the discovery payload received at `baud`.
    pub fn from_discovery(payload: &[u8], baud: u32) -> Result<Self> {
        if payload.len() < SAMPLE_LEN + MIN_INFO_LEN {
            return Err(Error::ProtocolState {
                expected: format!(
                    "at least {} bytes of discovery data",
                    SAMPLE_LEN + MIN_INFO_LEN
                ),
                actual: format!("{} bytes", payload.len()),
            });
        }

        let fosc = fosc_from_samples(&payload[..SAMPLE_LEN], baud);
        let info = InfoBlock::new(&payload[SAMPLE_LEN..]);
        let model = info.model();
        let model_info = identify_or_unknown(model);
        debug!("info: {}", hex_string(info.as_bytes()));

        Ok(Self {
            fosc,
            version: info.version(),
            info,
            model,
            name: model_info.name,
            rom_size: model_info.rom_size,
            variant: None,
            checksum: ChecksumMode::None,
            detect_baud: baud,
            baud: None,
        })
    }

    /// Pick the protocol variant, preferring an explicit choice.
    ///
    /// On success the checksum width is fixed and the trailing checksum
    /// bytes are dropped from the info block.
    pub fn resolve_variant(&mut self, explicit: Option<ProtocolVariant>) -> Option<ProtocolVariant> {
        let variant = explicit.or_else(|| ProtocolVariant::from_model(self.model))?;
        let checksum = variant
            .profile()
            .checksum;

        self.variant = Some(variant);
        self.checksum = checksum;
        self.info
            .strip_checksum(checksum.width());
        info!("Protocol: {variant}");
        Some(variant)
    }

    /// Oscillator frequency in Hz.
    pub fn fosc_hz(&self) -> u32 {
        (self.fosc * 1e6) as u32
    }

    /// Serializable summary.
    pub fn report(&self) -> DeviceReport {
        DeviceReport {
            model: self
                .name
                .clone(),
            model_id: self
                .model
                .to_string(),
            version: self
                .version
                .to_string(),
            fosc_mhz: self.fosc,
            rom_size: self.rom_size,
            protocol: self
                .variant
                .map(|v| v.to_string()),
            checksum_width: self
                .checksum
                .width(),
            baud: self
                .baud
                .unwrap_or(self.detect_baud),
            info: hex_string(
                self.info
                    .as_bytes(),
            ),
        }
    }
}

/// Device summary for display and JSON output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceReport {
    /// Model name.
    pub model: String,
    /// Raw model identifier as hex.
    pub model_id: String,
    /// Boot loader version.
    pub version: String,
    /// Oscillator frequency in MHz.
    pub fosc_mhz: f64,
    /// Program memory size in KB.
    pub rom_size: Option<u16>,
    /// Protocol variant name.
    pub protocol: Option<String>,
    /// Checksum width in bytes.
    pub checksum_width: usize,
    /// Current baud rate.
    pub baud: u32,
    /// Info block as hex.
    pub info: String,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model:    {} ({})", self.model, self.model_id)?;
        writeln!(f, "Version:  {}", self.version)?;
        writeln!(f, "FOSC:     {:.6} MHz", self.fosc_mhz)?;
        match self.rom_size {
            Some(rom) => writeln!(f, "ROM:      {rom} KB")?,
            None => writeln!(f, "ROM:      unknown")?,
        }
        writeln!(
            f,
            "Protocol: {}",
            self.protocol
                .as_deref()
                .unwrap_or("unknown")
        )?;
        write!(f, "Baud:     {}", self.baud)
    }
}
