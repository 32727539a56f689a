//! Program sequencer.
//!
//! Drives one device through its programming lifecycle:
//!
//! ```text
//! Idle -> Detecting -> VariantResolved -> BaudNegotiated -> Erased
//!      -> Flashing -> OptionsSet -> Terminated
//! ```
//!
//! Any fatal error moves the sequencer to `Failed` and is tagged with the
//! [`Step`] it happened in. Erase and flash failures are never retried.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stcflash::{Firmware, ProgramOptions, Programmer};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = Firmware::from_file("blink.hex")?;
//!     let mut programmer = Programmer::open("/dev/ttyUSB0", 2400, ProgramOptions::default())?;
//!
//!     programmer.program(firmware.data(), |progress| {
//!         println!("{:.0}%", progress * 100.0);
//!     })?;
//!     Ok(())
//! }
//! ```

use std::thread;

use log::{debug, info, warn};

use crate::error::{Error, Result, Step};
use crate::port::{Parity, Port, hex_string};
use crate::protocol::frame::{self, ChecksumMode, DEVICE_SYNC, Frame};
use crate::target::baud;
use crate::target::link::{Link, Timing};
use crate::target::session::DeviceSession;
use crate::target::variant::{EraseLayout, ProtocolVariant, QuirkExchange, VariantProfile};

/// Discovery pulse.
const DETECT_PULSE: [u8; 2] = [0x7F, 0x7F];

const CMD_ERASE: u8 = 0x84;
const CMD_FLASH: u8 = 0x00;
const CMD_OPTIONS: u8 = 0x8D;
const CMD_TERMINATE: u8 = 0x82;

/// Bytes written per flash command.
pub const CHUNK_SIZE: usize = 128;

/// Images are padded to a multiple of this.
pub const PAGE_SIZE: usize = 512;

/// Largest image the 16-bit chunk address can reach.
pub const MAX_IMAGE_SIZE: usize = 0x1_0000;

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    /// Nothing sent yet.
    Idle,
    /// Discovery done, no protocol variant for this model.
    Detecting,
    /// Device identified and its variant known.
    VariantResolved,
    /// Running at the negotiated baud rate.
    BaudNegotiated,
    /// Program memory erased.
    Erased,
    /// Writing chunks.
    Flashing,
    /// Option bytes handled.
    OptionsSet,
    /// Session closed.
    Terminated,
    /// A step failed; the session cannot continue.
    Failed,
}

/// Outcome of the option byte step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsOutcome {
    /// Option bytes were written.
    Applied,
    /// The variant has no usable option layout; nothing was sent.
    Unsupported,
}

/// Caller choices for a programming session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramOptions {
    /// Force a protocol variant instead of deriving it from the model.
    pub protocol: Option<ProtocolVariant>,
    /// Erase the EEPROM on next download (`None` leaves the flag alone).
    pub erase_eeprom: Option<bool>,
}

/// Zero-pad an image to a whole number of pages.
pub fn pad_image(image: &[u8]) -> Vec<u8> {
    let mut padded = image.to_vec();
    let fill = (PAGE_SIZE - 1) - (image.len().saturating_sub(1) % PAGE_SIZE);
    padded.resize(image.len() + fill, 0x00);
    padded
}

/// ISP programmer for one device.
pub struct Programmer<P: Port> {
    link: Link<P>,
    options: ProgramOptions,
    state: ProgramState,
    session: Option<DeviceSession>,
    flashed: bool,
}

impl<P: Port> Programmer<P> {
    /// Create a programmer on an open port with default timing.
    pub fn new(port: P, options: ProgramOptions) -> Result<Self> {
        Self::with_timing(port, options, Timing::default())
    }

    /// Create a programmer with explicit timing.
    ///
    /// An explicit protocol selects its parity up front; otherwise the port
    /// starts without parity.
    pub fn with_timing(mut port: P, options: ProgramOptions, timing: Timing) -> Result<Self> {
        let parity = options
            .protocol
            .map_or(Parity::None, |v| v.profile().parity);
        port.set_parity(parity)?;

        Ok(Self {
            link: Link::new(port, timing),
            options,
            state: ProgramState::Idle,
            session: None,
            flashed: false,
        })
    }

    /// Current state.
    pub fn state(&self) -> ProgramState {
        self.state
    }

    /// Device session, once detected.
    pub fn session(&self) -> Option<&DeviceSession> {
        self.session
            .as_ref()
    }

    /// Underlying port.
    pub fn port(&self) -> &P {
        self.link
            .port()
    }

    /// Consume the programmer and return the port.
    pub fn into_port(self) -> P {
        self.link
            .into_port()
    }

    fn fail(&mut self, step: Step, err: Error) -> Error {
        self.state = ProgramState::Failed;
        err.at(step)
    }

    fn require(&self, expected: ProgramState, op: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "cannot {op} in state {:?}",
                self.state
            )))
        }
    }

    fn current_session(&self) -> Result<&DeviceSession> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no device detected".into()))
    }

    fn profile(&self) -> Result<&'static VariantProfile> {
        let session = self.current_session()?;
        session
            .variant
            .map(ProtocolVariant::profile)
            .ok_or_else(|| Error::Unsupported(format!("no protocol for {}", session.name)))
    }

    /// Wait for the boot loader and identify the device.
    ///
    /// The device answers the discovery pulse only while its boot loader
    /// runs, i.e. right after power-up. An unknown model still yields a
    /// session, but it cannot be programmed.
    pub fn detect(&mut self) -> Result<&DeviceSession> {
        self.require(ProgramState::Idle, "detect")?;
        self.state = ProgramState::Detecting;

        match self.discover() {
            Ok(session) => Ok(self
                .session
                .insert(session)),
            Err(e) => Err(self.fail(Step::Detect, e)),
        }
    }

    fn discover(&mut self) -> Result<DeviceSession> {
        let timing = self
            .link
            .timing()
            .clone();
        self.link
            .set_checksum(ChecksumMode::None);

        info!(
            "Waiting for MCU on {}, please cycle power",
            self.link
                .port()
                .name()
        );

        let mut reply = None;
        for _ in 0..timing.detect_attempts {
            self.link
                .port_mut()
                .write_all_bytes(&DETECT_PULSE)?;
            match frame::recv(
                self.link
                    .port_mut(),
                &DEVICE_SYNC[2..],
                ChecksumMode::None,
                timing.detect_timeout,
            ) {
                Ok(frame) => {
                    reply = Some(frame);
                    break;
                },
                Err(Error::Timeout(_) | Error::Frame(_)) => {},
                Err(e) => return Err(e),
            }
        }
        let frame: Frame = reply.ok_or_else(|| {
            Error::Timeout(format!(
                "no answer after {} discovery pulses",
                timing.detect_attempts
            ))
        })?;

        let baud_rate = self
            .link
            .port()
            .baud_rate();
        let mut session = DeviceSession::from_discovery(&frame.payload, baud_rate)?;

        info!("Model ID: {}", session.model);
        info!("Model name: {}", session.name);
        match session.rom_size {
            Some(rom) => info!("ROM size: {rom}KB"),
            None => info!("ROM size: unknown"),
        }
        info!("FOSC: {:.3}MHz, version {}", session.fosc, session.version);

        if let Some(variant) = session.resolve_variant(self.options.protocol) {
            let profile = variant.profile();
            self.link
                .set_checksum(profile.checksum);
            self.link
                .port_mut()
                .set_parity(profile.parity)?;
            debug!(
                "checksum width {}, parity {:?}",
                profile.checksum
                    .width(),
                profile.parity
            );
            self.state = ProgramState::VariantResolved;
        } else {
            warn!("No protocol known for {}", session.name);
        }

        for (i, line) in session
            .info
            .as_bytes()
            .chunks(16)
            .enumerate()
        {
            info!("Info string [{i}]: {}", hex_string(line));
        }

        Ok(session)
    }

    fn exchange(&mut self, quirk: QuirkExchange) -> Result<()> {
        let payload = quirk.payload(
            self.current_session()?
                .model,
        );
        let timeout = self
            .link
            .timing()
            .recv_timeout;

        for _ in 0..quirk.repeat {
            debug!("Send fixed packet {:02X} {}", quirk.command, hex_string(&payload));
            self.link
                .send(quirk.command, &payload)?;
            let frame = self
                .link
                .expect(quirk.reply, timeout)?;
            if !frame
                .payload
                .is_empty()
            {
                return Err(Error::ProtocolState {
                    expected: "empty payload".into(),
                    actual: hex_string(&frame.payload),
                });
            }
        }
        Ok(())
    }

    /// Negotiate the fastest reliable baud rate.
    ///
    /// Runs the variant's fixed exchanges before and after the negotiation.
    pub fn handshake(&mut self) -> Result<u32> {
        let profile = match (self.state, self.profile()) {
            (ProgramState::VariantResolved, Ok(profile)) => profile,
            (ProgramState::Detecting, Err(e)) => return Err(self.fail(Step::Handshake, e)),
            (state, _) => {
                return Err(Error::InvalidState(format!(
                    "cannot negotiate baud rate in state {state:?}"
                )));
            },
        };

        if let Some(quirk) = profile.pre_handshake {
            self.exchange(quirk)
                .map_err(|e| self.fail(Step::PreHandshake, e))?;
        }

        let result = match self
            .session
            .as_mut()
        {
            Some(session) => baud::negotiate(&mut self.link, session, profile),
            None => Err(Error::InvalidState("no device detected".into())),
        };
        let baud = result.map_err(|e| self.fail(Step::Handshake, e))?;

        if let Some(quirk) = profile.post_handshake {
            self.exchange(quirk)
                .map_err(|e| self.fail(Step::PostHandshake, e))?;
        }

        self.state = ProgramState::BaudNegotiated;
        Ok(baud)
    }

    /// Erase the program memory.
    pub fn erase(&mut self) -> Result<()> {
        self.require(ProgramState::BaudNegotiated, "erase")?;
        self.erase_inner()
            .map_err(|e| self.fail(Step::Erase, e))?;
        self.state = ProgramState::Erased;
        Ok(())
    }

    fn erase_inner(&mut self) -> Result<()> {
        info!("Erase");
        let profile = self.profile()?;
        let payload = profile.erase_payload(
            self.current_session()?
                .rom_size,
        )?;
        let timeout = self
            .link
            .timing()
            .erase_timeout;

        self.link
            .send(CMD_ERASE, &payload)?;
        let frame = self
            .link
            .expect(profile.erase_reply, timeout)?;

        if profile.erase == EraseLayout::RomSize
            && !frame
                .payload
                .is_empty()
        {
            info!("Serial number: {}", hex_string(&frame.payload));
        }
        Ok(())
    }

    /// Start writing `image`.
    ///
    /// The image is zero-padded to a whole page. The returned iterator writes
    /// one chunk per step and yields the fraction written so far; it stops
    /// after the first error.
    pub fn flash(&mut self, image: &[u8]) -> Result<FlashWriter<'_, P>> {
        self.require(ProgramState::Erased, "flash")?;
        if image.is_empty() {
            return Err(Error::InvalidState("firmware image is empty".into()));
        }

        let image = pad_image(image);
        if image.len() > MAX_IMAGE_SIZE {
            let err = Error::Unsupported(format!(
                "image of {} bytes exceeds the 64KB address space",
                image.len()
            ));
            return Err(self.fail(Step::FlashChunk(MAX_IMAGE_SIZE / CHUNK_SIZE), err));
        }
        if let Some(rom) = self
            .current_session()?
            .rom_size
            .filter(|&rom| rom > 0 && image.len() > usize::from(rom) * 1024)
        {
            warn!("Image of {} bytes is larger than the {rom}KB ROM", image.len());
        }

        info!("Size of the binary: {}", image.len());
        self.state = ProgramState::Flashing;
        self.flashed = false;

        Ok(FlashWriter {
            programmer: self,
            image,
            offset: 0,
            done: false,
        })
    }

    /// Write `image`, reporting progress after each chunk.
    pub fn flash_all<F>(&mut self, image: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(f64),
    {
        for fraction in self.flash(image)? {
            progress(fraction?);
        }
        Ok(())
    }

    fn write_chunk(&mut self, image: &[u8], offset: usize) -> Result<()> {
        let chunk = &image[offset..offset + CHUNK_SIZE];
        debug!(
            "Flash code region ({offset:04X}, {:04X})",
            offset + CHUNK_SIZE - 1
        );

        let mut payload = Vec::with_capacity(6 + CHUNK_SIZE);
        payload.extend_from_slice(&[
            0x00,
            0x00,
            (offset >> 8) as u8,
            (offset & 0xFF) as u8,
            0x00,
            CHUNK_SIZE as u8,
        ]);
        payload.extend_from_slice(chunk);
        self.link
            .send(CMD_FLASH, &payload)?;

        let timeout = self
            .link
            .timing()
            .recv_timeout;
        let frame = self
            .link
            .recv(timeout)?;

        let expected = chunk
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        match frame
            .payload
            .first()
        {
            Some(&actual) if actual == expected => Ok(()),
            other => Err(Error::ProtocolState {
                expected: format!("chunk checksum {expected:02X}"),
                actual: other.map_or_else(|| "empty payload".to_string(), |b| format!("{b:02X}")),
            }),
        }
    }

    fn finish_flash(&mut self) -> Result<()> {
        if let Some(quirk) = self
            .profile()?
            .post_flash
        {
            self.exchange(quirk)?;
        }
        self.flashed = true;
        Ok(())
    }

    /// Update the option bytes.
    ///
    /// `erase_eeprom` overrides the value given at construction. Variants
    /// whose layout does not fit the info block report
    /// [`OptionsOutcome::Unsupported`] instead of failing.
    pub fn set_options(&mut self, erase_eeprom: Option<bool>) -> Result<OptionsOutcome> {
        if !(self.state == ProgramState::Flashing && self.flashed) {
            return Err(Error::InvalidState(format!(
                "cannot set options in state {:?}",
                self.state
            )));
        }

        let outcome = self
            .options_inner(erase_eeprom.or(self.options.erase_eeprom))
            .map_err(|e| self.fail(Step::Options, e))?;
        self.state = ProgramState::OptionsSet;
        Ok(outcome)
    }

    fn options_inner(&mut self, erase_eeprom: Option<bool>) -> Result<OptionsOutcome> {
        let profile = self.profile()?;
        let Some(layout) = profile.options else {
            warn!("Option bytes are not supported for this device");
            return Ok(OptionsOutcome::Unsupported);
        };

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no device detected".into()))?;
        if session
            .info
            .len()
            < layout.required_len()
        {
            warn!(
                "Info block of {} bytes is too short for the option layout",
                session
                    .info
                    .len()
            );
            return Ok(OptionsOutcome::Unsupported);
        }

        if let Some(erase) = erase_eeprom {
            info!("EEPROM erase on next download: {erase}");
            session
                .info
                .set_bits(layout.eeprom.offset, layout.eeprom.mask, !erase);
        }

        let payload = layout
            .build(
                session
                    .info
                    .as_bytes(),
                session.fosc_hz(),
            )
            .ok_or_else(|| Error::Unsupported("option layout".into()))?;
        let timeout = self
            .link
            .timing()
            .recv_timeout;

        self.link
            .send(CMD_OPTIONS, &payload)?;
        self.link
            .expect(CMD_OPTIONS, timeout)?;
        Ok(OptionsOutcome::Applied)
    }

    /// Tell the boot loader to start the user program.
    pub fn terminate(&mut self) -> Result<()> {
        self.require(ProgramState::OptionsSet, "terminate")?;
        info!("Send termination command");

        let delay = self
            .link
            .timing()
            .terminate_delay;
        let result = self
            .link
            .send(CMD_TERMINATE, &[])
            .and_then(|()| {
                self.link
                    .port_mut()
                    .flush()
                    .map_err(Error::from)
            });
        result.map_err(|e| self.fail(Step::Terminate, e))?;
        thread::sleep(delay);

        self.state = ProgramState::Terminated;
        Ok(())
    }

    /// Run the whole lifecycle: detect, handshake, erase, flash, options,
    /// terminate.
    pub fn program<F>(&mut self, image: &[u8], progress: F) -> Result<OptionsOutcome>
    where
        F: FnMut(f64),
    {
        if self.state == ProgramState::Idle {
            self.detect()?;
        }
        if let Err(e) = self.profile() {
            return Err(self.fail(Step::Detect, e));
        }

        let baud = self.handshake()?;
        info!("Baudrate: {baud}");
        self.erase()?;
        self.flash_all(image, progress)?;
        let outcome = self.set_options(None)?;
        self.terminate()?;
        Ok(outcome)
    }
}

/// Chunk-by-chunk flash writer returned by [`Programmer::flash`].
pub struct FlashWriter<'a, P: Port> {
    programmer: &'a mut Programmer<P>,
    image: Vec<u8>,
    offset: usize,
    done: bool,
}

impl<P: Port> FlashWriter<'_, P> {
    /// Padded image length.
    pub fn len(&self) -> usize {
        self.image
            .len()
    }

    /// Whether the padded image is empty.
    pub fn is_empty(&self) -> bool {
        self.image
            .is_empty()
    }
}

impl<P: Port> Iterator for FlashWriter<'_, P> {
    type Item = Result<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.image.len() {
            return None;
        }

        let index = self.offset / CHUNK_SIZE;
        if let Err(e) = self
            .programmer
            .write_chunk(&self.image, self.offset)
        {
            self.done = true;
            return Some(Err(self
                .programmer
                .fail(Step::FlashChunk(index), e)));
        }
        self.offset += CHUNK_SIZE;

        if self.offset >= self.image.len() {
            self.done = true;
            if let Err(e) = self
                .programmer
                .finish_flash()
            {
                return Some(Err(self
                    .programmer
                    .fail(Step::PostFlash, e)));
            }
        }

        Some(Ok(self.offset as f64 / self.image.len() as f64))
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{ProgramOptions, Programmer, Result};
    use crate::port::{NativePort, Parity, SerialConfig};

    impl Programmer<NativePort> {
        /// Open `port_name` at `low_baud` and create a programmer on it.
        pub fn open(port_name: &str, low_baud: u32, options: ProgramOptions) -> Result<Self> {
            let mut config = SerialConfig::new(port_name, low_baud);
            config.parity = options
                .protocol
                .map_or(Parity::None, |v| v.profile().parity);
            let port = NativePort::open(&config)?;
            Self::new(port, options)
        }
    }
}
