//! Protocol implementations.

pub mod frame;

// Re-export common types
pub use frame::{ChecksumMode, Frame, FrameError, decode, encode};
