//! The pilot: the device-side protocol endpoint.
//!
//! Owns the stored program image, the runtime memory buffer, and the list of
//! discovered I2C devices. Each decoded frame from the host is processed to
//! completion between VM runs (there are no suspension points inside one),
//! producing zero or more reply messages for the transport to send back.
//!
//! Errors are reported and execution continues; the pilot never retries on
//! behalf of the host.

pub mod render;
pub mod storage;

use crate::machine::errors::MachineError;
use crate::machine::vm::Program;
use crate::types::encoding::Decode;
use crate::types::words::{ProgramWord, StackWord};
use crate::utils::log::Logger;
use crate::wire::message::{RequestId, WireMessage};

use storage::Storage;

/// Bytes per UI state block reply. The protocol caps replies at 256 bytes.
pub const UI_BLOCK_SIZE: usize = 128;

/// Device addresses per I2C device page reply.
pub const I2C_DEVICE_PAGE: usize = 16;

/// Protocol error codes carried in `Error` frames.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The frame did not decode to a known message.
    InvalidMessage = 1,
    /// A message type the device only ever sends.
    UnexpectedMessageType = 2,
    /// Machine index past the instance table.
    UnknownMachine = 3,
    /// Function index past the addressed table.
    UnknownFunction = 4,
    /// The program image failed validation or initialization.
    InvalidProgram = 5,
    /// The run aborted with a runtime fault.
    MachineFault = 6,
    /// A UI state block request past the blob's end.
    UiStateReadOutOfBounds = 7,
}

/// Device-side endpoint.
pub struct Pilot<S: Storage> {
    storage: S,
    memory: Vec<StackWord>,
    i2c_devices: Vec<u16>,
    log: Logger,
}

impl<S: Storage> Pilot<S> {
    /// Creates a pilot with a runtime memory buffer of `memory_words` cells.
    pub fn new(storage: S, memory_words: usize) -> Self {
        Self {
            storage,
            memory: vec![0; memory_words],
            i2c_devices: Vec::new(),
            log: Logger::new("pilot"),
        }
    }

    /// Replaces the discovered I2C device list (fed by the capture layer).
    pub fn set_i2c_devices(&mut self, devices: Vec<u16>) {
        self.i2c_devices = devices;
    }

    /// Borrows the stored program for execution (e.g. by the render driver).
    pub fn program(&mut self) -> Result<Program<'_, '_>, MachineError> {
        Program::new(self.storage.program(), &mut self.memory)
    }

    /// Processes one decoded frame payload, returning the replies to send.
    pub fn process_frame(&mut self, payload: &[u8]) -> Vec<WireMessage> {
        let message = match WireMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(error) => {
                self.log.warn(&format!("undecodable frame: {error}"));
                return vec![spontaneous_error(
                    ErrorCode::InvalidMessage,
                    &error.to_string(),
                )];
            }
        };

        match message {
            WireMessage::CallRequest {
                request_id,
                machine_index,
                function_index,
                args,
            } => self.handle_call(request_id, |program| {
                program.call(machine_index, function_index as usize, &args)
            }),
            WireMessage::CallSharedRequest {
                request_id,
                function_index,
                args,
            } => self.handle_call(request_id, |program| {
                program.call_shared(function_index as usize, &args)
            }),
            WireMessage::LoadProgram { program, ui_state } => {
                self.handle_load(&program, ui_state.as_slice())
            }
            WireMessage::ReadUiStateBlock {
                request_id,
                block_number,
            } => self.handle_read_ui_state(request_id, block_number),
            WireMessage::ReadI2cDevices { request_id, offset } => {
                vec![self.i2c_devices_page(request_id, offset)]
            }
            WireMessage::CallReturn { .. }
            | WireMessage::Notification { .. }
            | WireMessage::Error { .. }
            | WireMessage::UiStateBlockReply { .. }
            | WireMessage::I2cDevicesReply { .. } => {
                vec![spontaneous_error(
                    ErrorCode::UnexpectedMessageType,
                    "message type is only sent by the device",
                )]
            }
        }
    }

    fn handle_call<F>(&mut self, request_id: RequestId, run: F) -> Vec<WireMessage>
    where
        F: FnOnce(&mut Program<'_, '_>) -> Result<Vec<StackWord>, MachineError>,
    {
        let result = match Program::new(self.storage.program(), &mut self.memory) {
            Ok(mut program) => run(&mut program),
            Err(error) => Err(error),
        };
        match result {
            Ok(values) => vec![WireMessage::CallReturn { request_id, values }],
            Err(error) => {
                self.log.warn(&format!("call {request_id} failed: {error}"));
                vec![request_error(request_id, &error)]
            }
        }
    }

    /// Validates and activates a new program image plus UI blob.
    ///
    /// The image is validated and every instance initialized before anything
    /// is persisted; a failing load leaves the previous program in place.
    fn handle_load(&mut self, image: &[ProgramWord], ui_state: &[u8]) -> Vec<WireMessage> {
        let mut memory = vec![0; self.memory.len()];
        let init_result: Result<(), MachineError> = (|| {
            let mut program = Program::new(image, &mut memory)?;
            for machine in 0..program.machine_count() {
                program.init(machine)?;
            }
            Ok(())
        })();

        if let Err(error) = init_result {
            self.log.error(&format!("program load rejected: {error}"));
            return vec![spontaneous_error(
                ErrorCode::InvalidProgram,
                &error.to_string(),
            )];
        }

        if self.storage.store_program(image).is_err()
            || self.storage.store_ui_state(ui_state).is_err()
        {
            return vec![spontaneous_error(
                ErrorCode::InvalidProgram,
                "could not persist the program",
            )];
        }

        // The initialized globals become the live runtime state.
        self.memory = memory;
        self.log.info(&format!(
            "loaded program: {} words, {} byte ui state",
            image.len(),
            ui_state.len()
        ));
        Vec::new()
    }

    fn handle_read_ui_state(
        &mut self,
        request_id: RequestId,
        block_number: u16,
    ) -> Vec<WireMessage> {
        let blob = self.storage.ui_state();
        let total_size = blob.len() as u32;

        let offset = block_number as usize * UI_BLOCK_SIZE;
        if total_size > 0 && offset >= blob.len() {
            return vec![WireMessage::Error {
                has_request_id: 1,
                request_id,
                error_code: ErrorCode::UiStateReadOutOfBounds as u16,
                message: b"ui state read out of bounds".to_vec(),
            }];
        }

        let end = (offset + UI_BLOCK_SIZE).min(blob.len());
        vec![WireMessage::UiStateBlockReply {
            request_id,
            total_size,
            block_number,
            block: blob[offset..end].to_vec(),
        }]
    }

    fn i2c_devices_page(&self, request_id: RequestId, offset: u16) -> WireMessage {
        let start = (offset as usize).min(self.i2c_devices.len());
        let end = (start + I2C_DEVICE_PAGE).min(self.i2c_devices.len());
        WireMessage::I2cDevicesReply {
            request_id,
            total_count: self.i2c_devices.len() as u16,
            devices: self.i2c_devices[start..end].to_vec(),
        }
    }
}

fn spontaneous_error(code: ErrorCode, message: &str) -> WireMessage {
    WireMessage::Error {
        has_request_id: 0,
        request_id: 0,
        error_code: code as u16,
        message: message.as_bytes().to_vec(),
    }
}

fn request_error(request_id: RequestId, error: &MachineError) -> WireMessage {
    WireMessage::Error {
        has_request_id: 1,
        request_id,
        error_code: error_code_for(error) as u16,
        message: error.to_string().into_bytes(),
    }
}

fn error_code_for(error: &MachineError) -> ErrorCode {
    match error {
        MachineError::InvalidProgramVersion(_)
        | MachineError::GlobalsBufferTooSmall(_)
        | MachineError::MemoryBufferTooSmall => ErrorCode::InvalidProgram,
        MachineError::MachineIndexOutOfRange(_) => ErrorCode::UnknownMachine,
        MachineError::FunctionIndexOutOfRange(_)
        | MachineError::SharedFunctionIndexOutOfRange(_) => ErrorCode::UnknownFunction,
        _ => ErrorCode::MachineFault,
    }
}
