//! List ports command implementation.

use anyhow::Result;
use console::style;
use log::warn;
use stcflash::{DetectedPort, detect_ports, preferred_port};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports().unwrap_or_else(|e| {
        warn!("Failed to enumerate serial ports: {e}");
        Vec::new()
    });

    if json {
        println!("{}", ports_json(&detected)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        eprintln!("  {} {}", style("•").green(), port.describe());
    }

    if let Some(port) = preferred_port(&detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&port.info.name).cyan().bold()
        );
    }

    Ok(())
}

/// Port list as pretty JSON.
fn ports_json(ports: &[DetectedPort]) -> Result<String> {
    let ports: Vec<serde_json::Value> = ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.info.name,
                "bridge": p.bridge.name(),
                "known": p.bridge.is_known(),
                "vid": p.info.vid,
                "pid": p.info.pid,
                "manufacturer": p.info.manufacturer,
                "product": p.info.product,
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&ports)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stcflash::PortInfo;

    #[test]
    fn test_ports_json() {
        let ports = vec![
            DetectedPort::classify(PortInfo {
                name: "/dev/ttyUSB0".into(),
                vid: Some(0x1A86),
                pid: Some(0x7523),
                manufacturer: None,
                product: Some("USB Serial".into()),
            }),
            DetectedPort::classify(PortInfo {
                name: "/dev/ttyS0".into(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
            }),
        ];

        let json: serde_json::Value = serde_json::from_str(&ports_json(&ports).unwrap()).unwrap();
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["name"], "/dev/ttyUSB0");
        assert_eq!(list[0]["known"], true);
        assert_eq!(list[0]["vid"], 0x1A86);
        assert_eq!(list[1]["known"], false);
        assert!(list[1]["vid"].is_null());
    }

    #[test]
    fn test_ports_json_empty() {
        assert_eq!(ports_json(&[]).unwrap(), "[]");
    }
}
