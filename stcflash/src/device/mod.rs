//! Serial port discovery and USB bridge classification.
//!
//! STC boards are almost always wired to the host through a USB-UART bridge.
//! Knowing the bridge lets the CLI pick a sensible default port.

use log::{debug, trace};

use crate::port::PortInfo;

/// Known USB-UART bridge chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum UsbBridge {
    /// WCH CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 family.
    Ftdi,
    /// Prolific PL2303.
    Pl2303,
    /// Anything else, or not a USB port.
    Unknown,
}

/// VID and accepted PIDs per bridge.
const KNOWN_BRIDGES: &[(u16, &[u16], UsbBridge)] = &[
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4], UsbBridge::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], UsbBridge::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], UsbBridge::Ftdi),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], UsbBridge::Pl2303),
];

impl UsbBridge {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| *known_vid == vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, bridge)| *bridge)
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Pl2303 => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognised.
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

/// A serial port together with its bridge classification.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port metadata.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub info: PortInfo,
    /// Bridge chip behind the port.
    pub bridge: UsbBridge,
}

impl DetectedPort {
    /// Classify a port.
    pub fn classify(info: PortInfo) -> Self {
        let bridge = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => UsbBridge::from_vid_pid(vid, pid),
            _ => UsbBridge::Unknown,
        };
        trace!("{}: bridge {bridge:?}", info.name);
        Self { info, bridge }
    }

    /// One-line description, e.g. `/dev/ttyUSB0 [CH340/CH341] - USB Serial`.
    pub fn describe(&self) -> String {
        let bridge = if self.bridge.is_known() {
            format!(" [{}]", self.bridge.name())
        } else if let (Some(vid), Some(pid)) = (self.info.vid, self.info.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };
        let product = self
            .info
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        format!("{}{bridge}{product}", self.info.name)
    }
}

/// Enumerate and classify the serial ports of this host.
#[cfg(feature = "native")]
pub fn detect_ports() -> crate::error::Result<Vec<DetectedPort>> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    let ports = NativePortEnumerator::list_ports()?;
    debug!("{} serial ports found", ports.len());
    Ok(ports
        .into_iter()
        .map(DetectedPort::classify)
        .collect())
}

/// First port behind a recognised bridge, if any.
pub fn preferred_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    let port = ports
        .iter()
        .find(|p| p.bridge.is_known())?;
    debug!("Preferred port: {}", port.describe());
    Some(port)
}
