//! Emulator run-state signal

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Emulator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorState {
    /// Emulator is stopped
    Stopped,
    /// Emulator is running
    Running,
    /// Emulator is paused
    Paused,
}

impl EmulatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

/// Shared handle to the emulator run state.
///
/// Cloned into every subsystem that has a wait loop or a service
/// thread; those consult it on each wakeup and bail out once the
/// emulator stops.
#[derive(Clone)]
pub struct EmuStatus {
    state: Arc<AtomicU8>,
}

impl EmuStatus {
    /// Create a new handle in the stopped state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(EmulatorState::Stopped as u8)),
        }
    }

    /// Get the current state
    pub fn state(&self) -> EmulatorState {
        EmulatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mark the emulator as running
    pub fn run(&self) {
        self.state.store(EmulatorState::Running as u8, Ordering::Release);
        tracing::info!("emulator running");
    }

    /// Mark the emulator as paused
    pub fn pause(&self) {
        self.state.store(EmulatorState::Paused as u8, Ordering::Release);
        tracing::info!("emulator paused");
    }

    /// Mark the emulator as stopped
    pub fn stop(&self) {
        self.state.store(EmulatorState::Stopped as u8, Ordering::Release);
        tracing::info!("emulator stopped");
    }

    /// Check if the emulator is running
    pub fn is_running(&self) -> bool {
        self.state() == EmulatorState::Running
    }

    /// Check if the emulator is paused
    pub fn is_paused(&self) -> bool {
        self.state() == EmulatorState::Paused
    }

    /// Check if the emulator is stopped
    pub fn is_stopped(&self) -> bool {
        self.state() == EmulatorState::Stopped
    }
}

impl Default for EmuStatus {
    fn default() -> Self {
        Self::new()
    }
}
