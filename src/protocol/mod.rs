//! Framing and message codecs.
//!
//! - `ProtocolHead`: fixed-size head declaring the body length
//! - `WebSocketHandshake`: the text head of the WebSocket upgrade path
//! - `Protocol`: head + body <-> `Message`
//! - `Codec`: payload serialization, opaque to the peer

pub use codec::{Codec, RawCodec, StringCodec};
pub use handshake::{WebSocketHandshake, DEFAULT_MAX_HANDSHAKE_SIZE, HANDSHAKE_HEAD_END};
pub use head::{
    LengthPrefixHead, ProtocolHead, TcpHeadFields, TcpProtocolHead, TCP_HEAD_SIZE,
    TCP_PROTOCOL_VERSION,
};
pub use message::{Message, MessageCategory, MessageMeta};
pub use tcp_protocol::{Protocol, TcpProtocol};

mod codec;
mod handshake;
mod head;
mod message;
mod tcp_protocol;
