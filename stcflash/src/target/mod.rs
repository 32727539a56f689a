//! Target-side protocol: model table, variants, session, baud negotiation
//! and the program sequencer.

pub mod baud;
pub mod link;
pub mod model;
pub mod programmer;
pub mod session;
pub mod variant;

pub use link::Timing;
pub use model::{ModelId, ModelInfo, identify, identify_or_unknown};
pub use programmer::{
    FlashWriter, OptionsOutcome, ProgramOptions, ProgramState, Programmer, pad_image,
};
pub use session::{DeviceReport, DeviceSession, FirmwareVersion, InfoBlock};
pub use variant::ProtocolVariant;
