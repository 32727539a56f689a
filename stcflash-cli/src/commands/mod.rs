//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod flash;
pub(crate) mod info;
pub(crate) mod ports;

use anyhow::Result;
use console::style;
use log::debug;
use stcflash::{NativePort, Programmer, SerialConfig, auto_isp, detect_ports, preferred_port};

use crate::Settings;

/// Port tried when nothing better is known.
#[cfg(windows)]
const FALLBACK_PORT: &str = "COM3";
#[cfg(not(windows))]
const FALLBACK_PORT: &str = "/dev/ttyUSB0";

/// Pick the serial port: explicit setting, then a recognised USB bridge,
/// then the platform default.
pub(crate) fn resolve_port(settings: &Settings) -> String {
    if let Some(port) = &settings.port {
        return port.clone();
    }

    match detect_ports() {
        Ok(ports) => {
            if let Some(port) = preferred_port(&ports) {
                return port
                    .info
                    .name
                    .clone();
            }
        },
        Err(e) => debug!("Port enumeration failed: {e}"),
    }
    FALLBACK_PORT.to_string()
}

/// Open the port, run auto-ISP if configured and wrap it in a programmer.
pub(crate) fn open_programmer(settings: &Settings) -> Result<Programmer<NativePort>> {
    let port_name = resolve_port(settings);
    if !settings.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).green(),
            settings.low_baud
        );
    }

    let mut port = NativePort::open(&SerialConfig::new(&port_name, settings.low_baud))?;
    if !settings
        .aisp_magic
        .is_empty()
    {
        debug!("Auto-ISP at {} baud", settings.aisp_baud);
        auto_isp(&mut port, settings.aisp_baud, &settings.aisp_magic)?;
    }

    Ok(Programmer::new(port, settings.options)?)
}
