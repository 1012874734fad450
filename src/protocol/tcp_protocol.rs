use std::fmt::Debug;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    Message, MessageMeta, ProtocolHead, TcpHeadFields, TcpProtocolHead, TCP_HEAD_SIZE,
};
use crate::{AppError, AppResult};

/// Full message codec on top of a [`ProtocolHead`].
pub trait Protocol: Send + Sync + Debug {
    fn head(&self) -> Arc<dyn ProtocolHead>;

    /// Serializes a message into one complete frame, head included.
    fn encode(&self, message: &Message) -> AppResult<Bytes>;

    /// Parses one complete frame as delivered by the peer's receive loop.
    fn decode(&self, frame: &Bytes) -> AppResult<Message>;
}

const BODY_META_SIZE: usize = 8;

/// Frames laid out as `[TcpProtocolHead][message_type u32][request_id u32][payload]`.
///
/// Heartbeats carry an empty body.
#[derive(Debug, Clone)]
pub struct TcpProtocol {
    head: Arc<TcpProtocolHead>,
}

impl TcpProtocol {
    pub fn new(max_frame_size: usize) -> Self {
        TcpProtocol {
            head: Arc::new(TcpProtocolHead::new(max_frame_size)),
        }
    }
}

impl Protocol for TcpProtocol {
    fn head(&self) -> Arc<dyn ProtocolHead> {
        self.head.clone()
    }

    fn encode(&self, message: &Message) -> AppResult<Bytes> {
        let meta = &message.meta;
        let body_size = if meta.is_heartbeat() {
            0
        } else {
            BODY_META_SIZE + message.payload.len()
        };
        let fields = TcpHeadFields {
            category: meta.category,
            last: meta.last,
            error: meta.error,
            body_size,
        };
        let mut buf = BytesMut::with_capacity(TCP_HEAD_SIZE + body_size);
        self.head.encode_fields(&fields, &mut buf)?;
        if body_size > 0 {
            buf.put_u32(meta.message_type);
            buf.put_u32(meta.request_id);
            buf.put_slice(&message.payload);
        }
        Ok(buf.freeze())
    }

    fn decode(&self, frame: &Bytes) -> AppResult<Message> {
        if frame.len() < TCP_HEAD_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame of {} bytes shorter than head",
                frame.len()
            )));
        }
        let fields = self.head.decode_fields(&frame[..TCP_HEAD_SIZE])?;
        let body_len = frame.len() - TCP_HEAD_SIZE;
        if body_len != fields.body_size {
            return Err(AppError::MalformedProtocol(format!(
                "head declares {} body bytes, frame carries {}",
                fields.body_size, body_len
            )));
        }

        let mut meta = MessageMeta {
            message_type: 0,
            category: fields.category,
            request_id: 0,
            last: fields.last,
            error: fields.error,
        };
        if body_len == 0 && meta.is_heartbeat() {
            return Ok(Message::new(meta, Bytes::new()));
        }
        if body_len < BODY_META_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "body of {} bytes misses message meta",
                body_len
            )));
        }
        let mut body = &frame[TCP_HEAD_SIZE..TCP_HEAD_SIZE + BODY_META_SIZE];
        meta.message_type = body.get_u32();
        meta.request_id = body.get_u32();
        Ok(Message::new(
            meta,
            frame.slice(TCP_HEAD_SIZE + BODY_META_SIZE..),
        ))
    }
}
