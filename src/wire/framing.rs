//! COBS framing for the USB byte stream.
//!
//! Every frame on the wire is COBS-encoded and terminated by a single `0x00`
//! byte. COBS byte stuffing removes all zero bytes from the payload, so the
//! terminator is unambiguous even though payloads carry arbitrary
//! `StackWord` bytes. The receiver accumulates bytes and hands each
//! completed frame to the codec; a malformed or oversized frame is dropped
//! and the stream resynchronizes at the next `0x00`.

use fluxpilot_derive::Error;

/// Largest accepted frame after decoding. A full program load with the
/// maximum UI blob fits well within this.
pub const MAX_FRAME_LEN: usize = 1 << 21;

/// Errors raised while decoding a frame from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A COBS group claimed more bytes than the frame holds.
    #[error("frame ended inside a stuffing group")]
    TruncatedGroup,
    /// A zero byte appeared inside the stuffed data.
    #[error("unexpected zero byte inside a frame")]
    ZeroInFrame,
    /// The accumulated frame exceeded [`MAX_FRAME_LEN`].
    #[error("frame exceeds the maximum frame length")]
    FrameTooLong,
}

/// COBS-encodes a payload and appends the `0x00` frame terminator.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 254 + 2);
    let mut code_index = out.len();
    out.push(0);
    let mut code: u8 = 1;

    for &byte in payload {
        if byte == 0 {
            out[code_index] = code;
            code_index = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_index] = code;
                code_index = out.len();
                out.push(0);
                code = 1;
            }
        }
    }

    out[code_index] = code;
    out.push(0);
    out
}

/// Decodes one COBS frame (without its `0x00` terminator).
pub fn decode_frame(stuffed: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(stuffed.len());
    let mut index = 0;

    while index < stuffed.len() {
        let code = stuffed[index] as usize;
        if code == 0 {
            return Err(FramingError::ZeroInFrame);
        }
        let end = index + code;
        if end > stuffed.len() {
            return Err(FramingError::TruncatedGroup);
        }
        out.extend_from_slice(&stuffed[index + 1..end]);
        index = end;
        if code != 0xFF && index < stuffed.len() {
            out.push(0);
        }
    }

    Ok(out)
}

/// Accumulates stream bytes into complete, decoded frames.
///
/// Owns its input buffer; it never aliases VM memory. The buffer is cleared
/// whether a frame decodes or not, so one bad frame cannot poison the next.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            overflowed: false,
        }
    }

    /// Feeds stream bytes in; returns the outcome of every frame completed
    /// by a `0x00` in this chunk, in arrival order.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, FramingError>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == 0 {
                if self.overflowed {
                    frames.push(Err(FramingError::FrameTooLong));
                } else if !self.buffer.is_empty() {
                    frames.push(decode_frame(&self.buffer));
                }
                self.buffer.clear();
                self.overflowed = false;
            } else if self.buffer.len() >= MAX_FRAME_LEN {
                self.overflowed = true;
            } else {
                self.buffer.push(byte);
            }
        }
        frames
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
