//! Port abstraction for serial communication.
//!
//! The protocol engine only talks to the [`Port`] trait. The native
//! implementation uses the `serialport` crate; tests plug in scripted ports.
//!
//! ```text
//! +------------------+
//! |  Programmer      |
//! |  (detect, baud,  |
//! |   erase, flash)  |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   Port Trait     |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};

/// Default baud rate used to open the port before negotiation.
pub const DEFAULT_LOW_BAUD: u32 = 2400;

/// Default baud rate used for the auto-ISP wake-up sequence.
pub const DEFAULT_AUTOISP_BAUD: u32 = 4800;

/// Delay after writing the auto-ISP magic.
const AUTOISP_SETTLE: Duration = Duration::from_millis(500);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Parity (None until the protocol variant says otherwise).
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_LOW_BAUD,
            timeout: Duration::from_millis(50),
            parity: Parity::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Even parity.
    Even,
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Byte-level transport used by the protocol engine.
///
/// Reads honour the configured timeout and return fewer bytes (or a
/// `TimedOut` error) when nothing arrives in time.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Set the parity mode.
    fn set_parity(&mut self, parity: Parity) -> Result<()>;

    /// Get the current parity mode.
    fn parity(&self) -> Parity;

    /// Discard pending input.
    fn clear_input(&mut self) -> Result<()>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        trace!("send: {}", hex_string(buf));
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

/// Read exactly `len` bytes, failing with [`Error::Timeout`] on a short read.
pub fn read_exact_timeout<P: Port + ?Sized>(port: &mut P, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }

    if filled > 0 {
        trace!("recv: {}", hex_string(&buf[..filled]));
    }

    if filled < len {
        return Err(Error::Timeout(format!("read {filled} of {len} bytes")));
    }

    Ok(buf)
}

/// Send the auto-ISP wake-up sequence.
///
/// Switches to `baud`, writes `magic`, waits for the target to reset into its
/// boot loader, then restores the previous baud rate. Does nothing when
/// `magic` is empty.
pub fn auto_isp<P: Port + ?Sized>(port: &mut P, baud: u32, magic: &[u8]) -> Result<()> {
    if magic.is_empty() {
        return Ok(());
    }

    let previous = port.baud_rate();
    debug!("Auto-ISP: sending {} magic bytes at {baud}", magic.len());

    port.set_baud_rate(baud)?;
    port.write_all_bytes(magic)?;
    thread::sleep(AUTOISP_SETTLE);
    port.set_baud_rate(previous)?;

    Ok(())
}

/// Format bytes as space separated hex.
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
