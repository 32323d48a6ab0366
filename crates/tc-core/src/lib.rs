//! Core infrastructure shared by all tricell components.

pub mod emulator;
pub mod logging;

pub use emulator::{EmuStatus, EmulatorState};
