//! FluxPilot library.
//!
//! Animates addressable-LED strands with a small stack-based virtual machine
//! programmed, loaded and controlled over a USB-framed RPC transport.
//! Provides the light machine and its assembler, the framed wire protocol,
//! the host-side deck dispatcher and the device-side pilot endpoint.

pub mod deck;
pub mod machine;
pub mod pilot;
pub mod types;
pub mod utils;
pub mod wire;
