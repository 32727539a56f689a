//! Info command implementation.

use anyhow::Result;
use console::style;

use crate::Settings;
use crate::commands::open_programmer;

/// Detect the device and print its report.
///
/// The session is left open; the device stays in its boot loader until the
/// next power cycle.
pub(crate) fn cmd_info(settings: &Settings, json: bool) -> Result<()> {
    let mut programmer = open_programmer(settings)?;

    if !settings.quiet {
        eprintln!(
            "{} Waiting for MCU, please cycle power...",
            style("⏳").yellow()
        );
    }
    let report = programmer
        .detect()?
        .report();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    eprintln!("\n{}", style("Device Information").bold().underlined());
    for line in report
        .to_string()
        .lines()
    {
        eprintln!("  {line}");
    }
    eprintln!("  Info:     {}", style(&report.info).dim());

    Ok(())
}
