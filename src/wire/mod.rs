//! Framed wire protocol shared by both ends of the USB link.
//!
//! [`framing`] turns the raw byte stream into COBS frames; [`message`]
//! defines the tagged messages carried inside them.

pub mod framing;
pub mod message;
