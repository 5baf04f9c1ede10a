use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Frame, PROTOCOL_VERSION};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest body either side puts in a frame
///
/// Base64 grows a body by a third, so half a frame leaves room for the
/// encoding plus headers.
pub const MAX_BODY_SIZE: usize = MAX_FRAME_SIZE / 2;

/// A frame could not be turned back into a [`Frame`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed frame: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while moving frames over a byte stream
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u8,
    #[serde(flatten)]
    frame: &'a Frame,
}

#[derive(Deserialize)]
struct Envelope {
    v: u8,
    #[serde(flatten)]
    frame: Frame,
}

/// Serialize a frame into its self-describing JSON record
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(&EnvelopeRef {
        v: PROTOCOL_VERSION,
        frame,
    })?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(json.len()));
    }
    Ok(json)
}

/// Parse one complete JSON record back into a frame
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new(e.to_string()))?;

    if envelope.v != PROTOCOL_VERSION {
        return Err(DecodeError::new(format!(
            "unsupported protocol version {} (expected {})",
            envelope.v, PROTOCOL_VERSION
        )));
    }

    if let Frame::ForwardResponse(resp) = &envelope.frame {
        if !(100..=599).contains(&resp.status) {
            return Err(DecodeError::new(format!(
                "status code {} out of range",
                resp.status
            )));
        }
    }

    Ok(envelope.frame)
}

/// Length-delimited codec carrying one JSON record per frame
///
/// Wire format:
/// ```text
/// +----------------+------------------+
/// | Length (4 bytes| JSON record      |
/// | big-endian u32)| (variable)       |
/// +----------------+------------------+
/// ```
#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let total_len = 4 + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);

        Ok(Some(decode(&payload)?))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = encode(&item)?;

        dst.reserve(4 + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);

        Ok(())
    }
}
