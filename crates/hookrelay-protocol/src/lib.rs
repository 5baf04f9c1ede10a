//! Wire protocol shared by the hookrelay relay and tunnel client
//!
//! Two record kinds travel over the tunnel: [`ForwardRequest`] (relay to
//! client) and [`ForwardResponse`] (client to relay). Each is a versioned,
//! tagged JSON record; [`FrameCodec`] length-prefixes them on a byte stream.

mod codec;
mod messages;

pub use codec::{
    decode, encode, CodecError, DecodeError, FrameCodec, MAX_BODY_SIZE, MAX_FRAME_SIZE,
};
pub use messages::{
    CorrelationId, ForwardRequest, ForwardResponse, Frame, Headers, PROTOCOL_VERSION,
    UPGRADE_PROTOCOL,
};
