//! Error types for stcflash.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::image::ihex::HexError;
use crate::protocol::frame::FrameError;

/// Result type for stcflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Programming step in which a fatal error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Device discovery and identification.
    Detect,
    /// Fixed exchange sent before the baud rate handshake.
    PreHandshake,
    /// Baud rate negotiation.
    Handshake,
    /// Fixed exchange sent after the baud rate handshake.
    PostHandshake,
    /// Program memory erase.
    Erase,
    /// Write of the chunk with the given index.
    FlashChunk(usize),
    /// Fixed exchange sent after the last chunk.
    PostFlash,
    /// Option byte update.
    Options,
    /// Session termination.
    Terminate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detect => write!(f, "detect"),
            Self::PreHandshake => write!(f, "pre-handshake"),
            Self::Handshake => write!(f, "handshake"),
            Self::PostHandshake => write!(f, "post-handshake"),
            Self::Erase => write!(f, "erase"),
            Self::FlashChunk(n) => write!(f, "flash-chunk-{n}"),
            Self::PostFlash => write!(f, "post-flash"),
            Self::Options => write!(f, "options"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// Coarse failure class, used to pick a process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The serial port could not be opened or used.
    Transport,
    /// The device did not answer or is not supported.
    Device,
    /// The device answered with something unexpected mid-session.
    Protocol,
    /// The firmware image could not be decoded.
    Image,
    /// Anything else.
    Other,
}

/// Error type for stcflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or corrupted frame.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// No candidate baud rate was accepted by the device.
    #[error("No usable baud rate found")]
    NoViableBaud,

    /// The device answered with an unexpected command or payload.
    #[error("Protocol state error: expected {expected}, got {actual}")]
    ProtocolState {
        /// What the sequencer waited for.
        expected: String,
        /// What the device actually sent.
        actual: String,
    },

    /// The model identifier is not in the model table.
    #[error("Unknown model {0:02X} {1:02X}")]
    UnknownModel(u8, u8),

    /// Firmware image could not be decoded.
    #[error("Image decode error: {0}")]
    ImageDecode(#[from] HexError),

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// An operation was invoked out of order.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A fatal error tagged with the step it happened in.
    #[error("{step} failed: {source}")]
    Step {
        /// Step that failed.
        step: Step,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Tag this error with the step it occurred in.
    #[must_use]
    pub fn at(self, step: Step) -> Self {
        match self {
            Self::Step { .. } => self,
            other => Self::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Step the error was raised in, if known.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Step { step, source } => match (step, source.kind()) {
                (Step::Detect, ErrorKind::Protocol) => ErrorKind::Device,
                (_, kind) => kind,
            },
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorKind::Transport,
            Self::Io(_) => ErrorKind::Transport,
            Self::Timeout(_) | Self::UnknownModel(..) | Self::Unsupported(_) => ErrorKind::Device,
            Self::Frame(_) | Self::NoViableBaud | Self::ProtocolState { .. } => {
                ErrorKind::Protocol
            },
            Self::ImageDecode(_) => ErrorKind::Image,
            Self::InvalidState(_) => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_display() {
        assert_eq!(Step::Detect.to_string(), "detect");
        assert_eq!(Step::FlashChunk(7).to_string(), "flash-chunk-7");
        assert_eq!(Step::Options.to_string(), "options");
    }

    #[test]
    fn test_at_names_step_once() {
        let err = Error::NoViableBaud
            .at(Step::Handshake)
            .at(Step::Erase);
        assert_eq!(err.step(), Some(Step::Handshake));
        assert_eq!(err.to_string(), "handshake failed: No usable baud rate found");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::NoViableBaud.kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::Timeout("x".into())
                .at(Step::Detect)
                .kind(),
            ErrorKind::Device
        );
        assert_eq!(
            Error::Frame(FrameError::Truncated)
                .at(Step::FlashChunk(2))
                .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::ImageDecode(HexError::ChecksumError(3)).kind(),
            ErrorKind::Image
        );
    }
}
