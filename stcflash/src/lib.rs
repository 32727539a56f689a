//! # stcflash
//!
//! A library for in-system programming of STC 8051 microcontrollers over
//! their serial boot loader.
//!
//! It covers:
//!
//! - Frame encoding and checksum validation
//! - Model identification from the boot loader's model identifier
//! - Automatic baud rate negotiation from the measured oscillator frequency
//! - Erase, chunked flash write and option byte update for the STC89/90,
//!   STC12C5Ax/STC10/STC11, STC12C52x/STC12C56x and STC12Cx052 families
//! - Raw binary and Intel HEX firmware images
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: `Serialize` for report types
//!
//! ## Example
//!
//! ```rust,no_run
//! use stcflash::{Firmware, ProgramOptions, Programmer, ProtocolVariant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = Firmware::from_file("firmware.hex")?;
//!
//!     let options = ProgramOptions {
//!         protocol: ProtocolVariant::from_name("89"),
//!         erase_eeprom: None,
//!     };
//!     let mut programmer = Programmer::open("/dev/ttyUSB0", 2400, options)?;
//!
//!     let device = programmer.detect()?;
//!     println!("{}", device.report());
//!
//!     programmer.program(firmware.data(), |progress| {
//!         println!("{:.0}%", progress * 100.0);
//!     })?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {
    device::detect_ports,
    port::{NativePort, NativePortEnumerator},
};
pub use {
    device::{DetectedPort, UsbBridge, preferred_port},
    error::{Error, ErrorKind, Result, Step},
    image::{Firmware, ImageFormat, ihex::HexError},
    port::{Parity, Port, PortEnumerator, PortInfo, SerialConfig, auto_isp},
    protocol::{ChecksumMode, Frame, FrameError},
    target::{
        DeviceReport, DeviceSession, ModelId, OptionsOutcome, ProgramOptions, ProgramState,
        Programmer, ProtocolVariant, Timing,
    },
};
