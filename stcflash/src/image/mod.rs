//! Firmware image loading.
//!
//! Images are either raw binaries or Intel HEX files, told apart by file
//! extension (`.hex` and `.ihx` are Intel HEX, anything else is raw).

pub mod ihex;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;

use crate::error::Result;

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ImageFormat {
    /// Raw binary, loaded at address 0.
    Binary,
    /// Intel HEX text.
    IntelHex,
}

impl ImageFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("hex" | "ihx") => Self::IntelHex,
            _ => Self::Binary,
        }
    }
}

/// A flat firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    data: Vec<u8>,
    format: ImageFormat,
}

impl Firmware {
    /// Load an image from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ImageFormat::from_path(path);
        debug!("Loading {format:?} image from: {}", path.display());

        let mut reader = BufReader::new(File::open(path)?);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;

        Self::from_bytes(&raw, format)
    }

    /// Decode an image held in memory.
    pub fn from_bytes(raw: &[u8], format: ImageFormat) -> Result<Self> {
        let data = match format {
            ImageFormat::Binary => raw.to_vec(),
            ImageFormat::IntelHex => ihex::decode_hex(&String::from_utf8_lossy(raw))?,
        };
        Ok(Self { data, format })
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Format the image was loaded from.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }
}
