//! Baud rate negotiation.
//!
//! The boot loader derives its UART timer reload value from the oscillator
//! frequency measured during discovery. Each candidate rate is offered with a
//! trial command; the first one the device answers at is committed.

use std::thread;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::target::link::Link;
use crate::target::session::DeviceSession;
use crate::target::variant::VariantProfile;

/// Candidate rates, fastest first.
pub const BAUD_CANDIDATES: [u32; 10] = [
    115_200, 57_600, 38_400, 28_800, 19_200, 14_400, 9_600, 4_800, 2_400, 1_200,
];

/// Largest accepted relative rounding error of the timer divisor.
pub const MAX_DIVISOR_ERROR: f64 = 0.03;

/// Absorbs float noise so an error of exactly 3 % still passes.
const ERROR_SLACK: f64 = 1e-9;

/// Trial command.
const CMD_TRIAL: u8 = 0x8F;
/// Commit command.
const CMD_COMMIT: u8 = 0x8E;

/// Timer settings for one candidate rate.
#[derive(Debug, Clone, PartialEq)]
pub struct BaudConfig {
    /// Candidate baud rate.
    pub baud: u32,
    /// Timer reload value.
    pub timer: u16,
    /// Relative rounding error of the divisor.
    pub error: f64,
    /// Parameter bytes sent with both trial and commit.
    pub params: [u8; 5],
}

/// Relative error between a divisor and its nearest integer.
pub fn divisor_error(divisor: f64) -> f64 {
    (divisor.round() - divisor).abs() / divisor
}

/// Whether a rounding error is small enough for reliable communication.
pub fn within_tolerance(error: f64) -> bool {
    error <= MAX_DIVISOR_ERROR + ERROR_SLACK
}

/// Compute the timer settings for `baud`, `None` if the rate is unusable.
///
/// `initial_baud` is the rate the session was opened at; it is encoded in the
/// last parameter byte as `initial_baud / 60`, so rates above 15300 yield `None`.
pub fn baud_config(
    profile: &VariantProfile,
    fosc_mhz: f64,
    baud: u32,
    initial_baud: u32,
) -> Option<BaudConfig> {
    let mut divisor = fosc_mhz * 1e6 / f64::from(baud) / 32.0;
    if profile.double_divisor {
        divisor *= 2.0;
    }

    let error = divisor_error(divisor);
    if !divisor.is_finite() || divisor <= 0.0 || !within_tolerance(error) {
        return None;
    }

    let rounded = (divisor + 0.5) as u32;
    let timer = if profile.double_divisor {
        if divisor > 255.0 {
            return None;
        }
        0xC000 + 0x100 - rounded
    } else {
        0x1_0000u32.checked_sub(rounded)?
    };
    let timer = u16::try_from(timer).ok()?;

    let [hi, lo] = timer.to_be_bytes();
    let reload = ((256 - u32::from(lo)) * 2).min(0xFE) as u8;
    let initial = u8::try_from(initial_baud / 60).ok()?;
    let params = [hi, lo, 0xFF - hi, reload, initial];

    Some(BaudConfig {
        baud,
        timer,
        error,
        params,
    })
}

/// Negotiate the fastest usable rate and commit it.
///
/// Every trial restores the initial rate before the next candidate. Returns
/// [`Error::NoViableBaud`] when no candidate is answered.
pub fn negotiate<P: Port>(link: &mut Link<P>, session: &mut DeviceSession, profile: &VariantProfile) -> Result<u32> {
    let initial = link
        .port()
        .baud_rate();
    let wait = profile.wait_index(session.fosc);
    let recv_timeout = link
        .timing()
        .recv_timeout;
    let settle = link
        .timing()
        .baud_settle;

    let mut selected = None;
    for baud in BAUD_CANDIDATES {
        let Some(config) = baud_config(profile, session.fosc, baud, initial) else {
            debug!("skip {baud}: divisor out of tolerance");
            continue;
        };

        info!("Test baudrate {baud} (accuracy {:.4}) using config {:02X?}", config.error, config.params);

        let mut trial = config
            .params
            .to_vec();
        trial.push(0x80 + wait);
        link.send(CMD_TRIAL, &trial)?;

        let answer = link
            .switch_baud(baud, true)
            .and_then(|()| link.recv(recv_timeout));
        link.switch_baud(initial, false)?;

        match answer {
            Ok(_) => {
                selected = Some(config);
                break;
            },
            Err(e @ (Error::Timeout(_) | Error::Frame(_))) => {
                debug!("no answer at {baud}: {e}");
                thread::sleep(settle);
                link.port_mut()
                    .clear_input()?;
            },
            Err(e) => return Err(e),
        }
    }

    let config = selected.ok_or(Error::NoViableBaud)?;
    info!("Change baudrate to {}", config.baud);

    link.send(CMD_COMMIT, &config.params)?;
    link.switch_baud(config.baud, true)?;
    session.baud = Some(config.baud);
    link.recv(recv_timeout)?;

    Ok(config.baud)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::variant::ProtocolVariant;

    fn fosc_for(divisor: f64, baud: u32) -> f64 {
        divisor * 32.0 * f64::from(baud) / 1e6
    }

    #[test]
    fn test_exact_divisor_89() {
        let profile = ProtocolVariant::V89.profile();
        let config = baud_config(profile, 11.0592, 9600, 2400).unwrap();

        assert_eq!(config.timer, 0xFFDC);
        assert!(config.error < 1e-9);
        assert_eq!(config.params, [0xFF, 0xDC, 0x00, 0x48, 40]);
    }

    #[test]
    fn test_doubled_divisor_12() {
        let profile = ProtocolVariant::V12C5A.profile();
        let config = baud_config(profile, 11.0592, 9600, 2400).unwrap();

        // divisor 72: 0xC000 + 0x100 - 72
        assert_eq!(config.timer, 0xC0B8);
        assert_eq!(config.params, [0xC0, 0xB8, 0x3F, 0x90, 40]);
    }

    #[test]
    fn test_reload_byte_is_capped() {
        let profile = ProtocolVariant::V89.profile();
        let config = baud_config(profile, 11.0592, 115_200, 2400).unwrap();

        // divisor 3: low byte FD, (256 - 253) * 2 = 6
        assert_eq!(config.timer, 0xFFFD);
        assert_eq!(config.params[3], 6);

        // divisor 200: low byte 38, (256 - 56) * 2 = 400
        let config = baud_config(profile, 15.36, 2400, 2400).unwrap();
        assert_eq!(config.timer, 0xFF38);
        assert_eq!(config.params[3], 0xFE);
    }

    #[test]
    fn test_inexact_divisor_rejected() {
        let profile = ProtocolVariant::V89.profile();
        // 12 MHz at 115200: divisor 3.255
        assert!(baud_config(profile, 12.0, 115_200, 2400).is_none());
        assert!(baud_config(profile, 12.0, 9600, 2400).is_some());
    }

    #[test]
    fn test_tolerance_boundary() {
        assert!(within_tolerance(MAX_DIVISOR_ERROR));
        assert!(!within_tolerance(MAX_DIVISOR_ERROR + 1e-6));
        assert!(within_tolerance(0.0));
    }

    #[test]
    fn test_divisor_near_threshold() {
        let profile = ProtocolVariant::V89.profile();
        // 0.46 / 15.46 is just under 3 %, 0.47 / 15.47 just over
        assert!(baud_config(profile, fosc_for(15.46, 9600), 9600, 2400).is_some());
        assert!(baud_config(profile, fosc_for(15.47, 9600), 9600, 2400).is_none());
    }

    #[test]
    fn test_divisor_exactly_at_threshold() {
        let profile = ProtocolVariant::V89.profile();
        for n in [10.0, 12.0, 15.0, 16.0] {
            // rounds down to n with exactly 3 % error
            let config = baud_config(profile, fosc_for(n / 0.97, 9600), 9600, 2400)
                .unwrap_or_else(|| panic!("{n}/0.97 should be accepted"));
            assert!((config.error - MAX_DIVISOR_ERROR).abs() < 1e-9);
        }
        for n in [10.0, 12.0, 15.0] {
            assert!(baud_config(profile, fosc_for(n / 0.969, 9600), 9600, 2400).is_none());
        }
        // rounds up to 12
        assert!(baud_config(profile, fosc_for(12.0 / 1.03, 9600), 9600, 2400).is_some());
        assert!(baud_config(profile, fosc_for(12.0 / 1.031, 9600), 9600, 2400).is_none());
    }

    #[test]
    fn test_initial_baud_must_fit_parameter_byte() {
        let profile = ProtocolVariant::V89.profile();
        assert_eq!(baud_config(profile, 11.0592, 9600, 15_300).unwrap().params[4], 255);
        assert!(baud_config(profile, 11.0592, 9600, 15_360).is_none());
        assert!(baud_config(profile, 11.0592, 9600, 19_200).is_none());
    }

    #[test]
    fn test_doubled_divisor_limit() {
        let profile = ProtocolVariant::V12Cx052.profile();
        // 24 MHz at 1200: doubled divisor 1250
        assert!(baud_config(profile, 24.0, 1200, 2400).is_none());
        assert!(baud_config(profile, 24.0, 9600, 2400).is_some());
    }

    #[test]
    fn test_divisor_error() {
        assert!((divisor_error(36.0)).abs() < 1e-12);
        assert!((divisor_error(10.5) - 0.5 / 10.5).abs() < 1e-12);
    }
}
