//! Wire protocol messages between the deck (host) and the pilot (device).
//!
//! Each message is one COBS frame whose first byte is an ASCII tag, followed
//! by the payload fields in order, all integers little-endian. `StackWord`
//! values are four bytes, `ProgramWord` values two. Sequences carry a `u16`
//! count; the UI state blob carries a `u32` byte length.
//!
//! The derived codec reproduces this layout exactly: the enum discriminants
//! are the tag bytes, and fields encode in declaration order.

use fluxpilot_derive::BinaryCodec;

use crate::types::encoding::Blob;
use crate::types::words::{ProgramWord, StackWord};

/// Identifies a pending host-originated call.
pub type RequestId = u16;

/// A framed protocol message.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum WireMessage {
    /// Host asks the device to run a machine function.
    CallRequest {
        request_id: RequestId,
        machine_index: u16,
        function_index: u16,
        args: Vec<StackWord>,
    } = b'R',
    /// Device returns a call's residual stack to the host.
    CallReturn {
        request_id: RequestId,
        values: Vec<StackWord>,
    } = b'r',
    /// Device-originated event delivery, not tied to a request.
    Notification {
        machine_index: u16,
        function_index: u16,
        values: Vec<StackWord>,
    } = b'N',
    /// Error report; `has_request_id` is zero for spontaneous errors.
    Error {
        has_request_id: u8,
        request_id: RequestId,
        error_code: u16,
        message: Vec<u8>,
    } = b'E',
    /// Host replaces the stored program image and UI state blob.
    LoadProgram {
        program: Vec<ProgramWord>,
        ui_state: Blob,
    } = b'L',
    /// Host requests one block of the persisted UI state blob.
    ReadUiStateBlock {
        request_id: RequestId,
        block_number: u16,
    } = b'U',
    /// One block of the UI state blob; `total_size` is authoritative.
    UiStateBlockReply {
        request_id: RequestId,
        total_size: u32,
        block_number: u16,
        block: Vec<u8>,
    } = b'u',
    /// Host requests a page of discovered I2C device addresses.
    ReadI2cDevices {
        request_id: RequestId,
        offset: u16,
    } = b'I',
    /// One page of I2C device addresses.
    I2cDevicesReply {
        request_id: RequestId,
        total_count: u16,
        devices: Vec<u16>,
    } = b'i',
    /// Host asks the device to run a shared function.
    CallSharedRequest {
        request_id: RequestId,
        function_index: u16,
        args: Vec<StackWord>,
    } = b'C',
}

impl WireMessage {
    /// The request id this message replies to or carries, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            WireMessage::CallRequest { request_id, .. }
            | WireMessage::CallReturn { request_id, .. }
            | WireMessage::ReadUiStateBlock { request_id, .. }
            | WireMessage::UiStateBlockReply { request_id, .. }
            | WireMessage::ReadI2cDevices { request_id, .. }
            | WireMessage::I2cDevicesReply { request_id, .. }
            | WireMessage::CallSharedRequest { request_id, .. } => Some(*request_id),
            WireMessage::Error {
                has_request_id,
                request_id,
                ..
            } => (*has_request_id != 0).then_some(*request_id),
            WireMessage::Notification { .. } | WireMessage::LoadProgram { .. } => None,
        }
    }
}
