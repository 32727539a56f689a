//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::Path;
use stcflash::{Firmware, OptionsOutcome};

use crate::commands::open_programmer;
use crate::{CliError, Settings, use_fancy_output};

/// Load the firmware image, keeping read failures apart from decode failures.
fn load_firmware(path: &Path) -> Result<Firmware> {
    let firmware = match Firmware::from_file(path) {
        Ok(firmware) => firmware,
        Err(stcflash::Error::Io(e)) => {
            return Err(e).with_context(|| format!("Failed to read firmware {}", path.display()));
        },
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load firmware {}", path.display()));
        },
    };
    if firmware.is_empty() {
        return Err(CliError::EmptyImage(path.to_path_buf()).into());
    }
    Ok(firmware)
}

/// Flash command implementation.
pub(crate) fn cmd_flash(settings: &Settings, path: &Path) -> Result<()> {
    let quiet = settings.quiet;
    if !quiet {
        eprintln!("{} Loading firmware: {}", style("📦").cyan(), path.display());
    }
    let firmware = load_firmware(path)?;
    if !quiet {
        eprintln!(
            "{} {:?} image, {} bytes",
            style("ℹ").blue(),
            firmware.format(),
            firmware.len()
        );
    }

    let mut programmer = open_programmer(settings)?;

    if !quiet {
        eprintln!(
            "{} Waiting for MCU, please cycle power...",
            style("⏳").yellow()
        );
    }
    let report = programmer
        .detect()?
        .report();
    if !quiet {
        eprintln!(
            "{} Detected {} (version {}, {:.3} MHz)",
            style("✓").green(),
            style(&report.model).cyan().bold(),
            report.version,
            report.fosc_mhz
        );
    }

    let baud = programmer.handshake()?;
    if !quiet {
        eprintln!("{} Switched to {baud} baud", style("✓").green());
        eprintln!("{} Erasing...", style("🗑").red());
    }
    programmer.erase()?;

    let pb = if quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    };
    pb.set_message("Flashing");

    let flash_result = programmer.flash_all(firmware.data(), |fraction| {
        pb.set_position((fraction * 100.0).round() as u64);
    });
    if let Err(err) = flash_result {
        pb.abandon();
        return Err(err.into());
    }
    pb.finish_with_message("Complete");

    match programmer.set_options(None)? {
        OptionsOutcome::Applied => {
            if !quiet {
                eprintln!("{} Option bytes written", style("✓").green());
            }
        },
        OptionsOutcome::Unsupported => {
            if !quiet {
                eprintln!(
                    "{} Option bytes not supported for this device, left unchanged",
                    style("⚠").yellow()
                );
            }
        },
    }

    programmer.terminate()?;

    if !quiet {
        eprintln!("\n{} Programming completed", style("🎉").green().bold());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_firmware_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, [0x02, 0x00, 0x03]).unwrap();

        let firmware = load_firmware(&path).unwrap();
        assert_eq!(firmware.data(), &[0x02, 0x00, 0x03]);
    }

    #[test]
    fn test_load_firmware_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, b"").unwrap();

        let err = load_firmware(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::EmptyImage(_))
        ));
    }

    #[test]
    fn test_load_firmware_missing_is_not_a_port_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_firmware(&dir.path().join("missing.hex")).unwrap_err();
        assert!(err.downcast_ref::<stcflash::Error>().is_none());
        assert!(err.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_load_firmware_bad_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.hex");
        fs::write(&path, ":0300000002000300\n").unwrap();

        let err = load_firmware(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<stcflash::Error>(),
            Some(stcflash::Error::ImageDecode(_))
        ));
    }
}
