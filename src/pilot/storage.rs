//! Persisted-state interface for the pilot.
//!
//! Two artifacts survive reboot: the last-loaded program image and the
//! last-received UI state blob, which the device never interprets. The
//! flash-backed implementation lives with the firmware; [`MemStorage`]
//! backs tests and host-side simulation.

use fluxpilot_derive::Error;

use crate::types::words::ProgramWord;

/// Errors raised by a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend rejected or failed the write.
    #[error("storage write failed")]
    WriteFailed,
    /// The artifact does not fit the backend's capacity.
    #[error("artifact too large for storage")]
    TooLarge,
}

/// Storage for the program image and UI state blob.
pub trait Storage {
    fn store_program(&mut self, words: &[ProgramWord]) -> Result<(), StorageError>;
    fn program(&self) -> &[ProgramWord];
    fn store_ui_state(&mut self, bytes: &[u8]) -> Result<(), StorageError>;
    fn ui_state(&self) -> &[u8];
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemStorage {
    program: Vec<ProgramWord>,
    ui_state: Vec<u8>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn store_program(&mut self, words: &[ProgramWord]) -> Result<(), StorageError> {
        self.program = words.to_vec();
        Ok(())
    }

    fn program(&self) -> &[ProgramWord] {
        &self.program
    }

    fn store_ui_state(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.ui_state = bytes.to_vec();
        Ok(())
    }

    fn ui_state(&self) -> &[u8] {
        &self.ui_state
    }
}
