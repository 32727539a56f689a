//! Framed command link over a [`Port`].

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::frame::{self, ChecksumMode, DEVICE_SYNC, Frame};

/// Protocol timing parameters.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Timeout for an ordinary reply frame.
    pub recv_timeout: Duration,
    /// Timeout for the erase reply.
    pub erase_timeout: Duration,
    /// Timeout for each discovery reply.
    pub detect_timeout: Duration,
    /// Number of discovery pulses before giving up.
    pub detect_attempts: usize,
    /// Settling delay around baud rate switches.
    pub baud_settle: Duration,
    /// Delay after the terminate command.
    pub terminate_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(1),
            erase_timeout: Duration::from_secs(10),
            detect_timeout: Duration::from_millis(15),
            detect_attempts: 1000,
            baud_settle: Duration::from_millis(200),
            terminate_delay: Duration::from_millis(200),
        }
    }
}

/// Command link: a port, the checksum width in effect and the timing.
pub struct Link<P: Port> {
    port: P,
    checksum: ChecksumMode,
    timing: Timing,
}

impl<P: Port> Link<P> {
    /// Wrap a port. The checksum width starts at zero.
    pub fn new(port: P, timing: Timing) -> Self {
        Self {
            port,
            checksum: ChecksumMode::None,
            timing,
        }
    }

    /// Underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Underlying port, mutable.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the link and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Timing in effect.
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Checksum width in effect.
    pub fn checksum(&self) -> ChecksumMode {
        self.checksum
    }

    /// Change the checksum width.
    pub fn set_checksum(&mut self, checksum: ChecksumMode) {
        self.checksum = checksum;
    }

    /// Send one command frame.
    pub fn send(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        debug!("send: cmd {command:02X}, {} payload bytes", payload.len());
        let raw = frame::encode(command, payload, self.checksum);
        self.port
            .write_all_bytes(&raw)
    }

    /// Receive one device frame.
    pub fn recv(&mut self, timeout: Duration) -> Result<Frame> {
        frame::recv(&mut self.port, &DEVICE_SYNC, self.checksum, timeout)
    }

    /// Receive one frame and check its command byte.
    pub fn expect(&mut self, command: u8, timeout: Duration) -> Result<Frame> {
        let frame = self.recv(timeout)?;
        if frame.command != command {
            return Err(Error::ProtocolState {
                expected: format!("command {command:02X}"),
                actual: format!("command {:02X}", frame.command),
            });
        }
        Ok(frame)
    }

    /// Switch the port baud rate.
    ///
    /// With `settle`, pending output is flushed and the link waits before
    /// switching, so the device sees the last frame at the old rate.
    pub fn switch_baud(&mut self, baud: u32, settle: bool) -> Result<()> {
        if settle {
            self.port
                .flush()?;
            thread::sleep(
                self.timing
                    .baud_settle,
            );
        }
        self.port
            .set_baud_rate(baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::protocol::frame::encode;

    fn fast() -> Timing {
        Timing {
            recv_timeout: Duration::from_millis(5),
            baud_settle: Duration::ZERO,
            ..Timing::default()
        }
    }

    #[test]
    fn test_send_uses_checksum_width() {
        let mut link = Link::new(MockPort::silent(2400), fast());
        link.send(0x82, &[])
            .unwrap();
        link.set_checksum(ChecksumMode::Byte);
        link.send(0x82, &[])
            .unwrap();

        let writes = &link
            .port()
            .writes;
        assert_eq!(writes[0], encode(0x82, &[], ChecksumMode::None));
        assert_eq!(writes[1], vec![0x46, 0xB9, 0x6A, 0x00, 0x06, 0x82, 0xF2, 0x16]);
    }

    #[test]
    fn test_expect_rejects_wrong_command() {
        let mut port = MockPort::silent(2400);
        port.read_buf
            .extend([0x46, 0xB9, 0x68, 0x00, 0x05, 0x81, 0x16]);
        let mut link = Link::new(port, fast());

        assert!(matches!(
            link.expect(0x80, Duration::from_millis(5)),
            Err(Error::ProtocolState { .. })
        ));
    }

    #[test]
    fn test_switch_baud() {
        let mut link = Link::new(MockPort::silent(2400), fast());
        link.switch_baud(19200, true)
            .unwrap();
        link.switch_baud(2400, false)
            .unwrap();
        assert_eq!(
            link.port()
                .bauds,
            vec![2400, 19200, 2400]
        );
    }
}
