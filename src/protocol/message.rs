use bytes::{Bytes, BytesMut};

use super::Codec;
use crate::{AppError, AppResult};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Message = 0,
    Request = 1,
    Response = 2,
    Heartbeat = 3,
}

impl TryFrom<u8> for MessageCategory {
    type Error = AppError;

    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            0 => Ok(MessageCategory::Message),
            1 => Ok(MessageCategory::Request),
            2 => Ok(MessageCategory::Response),
            3 => Ok(MessageCategory::Heartbeat),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown message category {}",
                other
            ))),
        }
    }
}

/// Routing and correlation fields of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    pub message_type: u32,
    pub category: MessageCategory,
    /// Correlates a response with its request; 0 for plain messages.
    pub request_id: u32,
    /// Terminal part of a (possibly multi-part) response.
    pub last: bool,
    pub error: bool,
}

impl MessageMeta {
    pub fn message(message_type: u32) -> Self {
        MessageMeta {
            message_type,
            category: MessageCategory::Message,
            request_id: 0,
            last: true,
            error: false,
        }
    }

    pub fn request(message_type: u32, request_id: u32) -> Self {
        MessageMeta {
            message_type,
            category: MessageCategory::Request,
            request_id,
            last: true,
            error: false,
        }
    }

    /// Response to `request`, keeping its request id.
    pub fn response_to(request: &MessageMeta, message_type: u32, last: bool) -> Self {
        MessageMeta {
            message_type,
            category: MessageCategory::Response,
            request_id: request.request_id,
            last,
            error: false,
        }
    }

    /// A heartbeat probe has `last` unset, its answer has it set.
    pub fn heartbeat(pong: bool) -> Self {
        MessageMeta {
            message_type: 0,
            category: MessageCategory::Heartbeat,
            request_id: 0,
            last: pong,
            error: false,
        }
    }

    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.category == MessageCategory::Heartbeat
    }

    pub fn is_heartbeat_probe(&self) -> bool {
        self.is_heartbeat() && !self.last
    }
}

/// One application message: meta plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub meta: MessageMeta,
    pub payload: Bytes,
}

impl Message {
    pub fn new(meta: MessageMeta, payload: Bytes) -> Self {
        Message { meta, payload }
    }

    /// Encodes `item` through `codec` into the payload.
    pub fn encode<C: Codec>(meta: MessageMeta, codec: &C, item: &C::Item) -> AppResult<Self> {
        let mut payload = BytesMut::new();
        codec.encode(item, &mut payload)?;
        Ok(Message {
            meta,
            payload: payload.freeze(),
        })
    }

    pub fn decode_payload<C: Codec>(&self, codec: &C) -> AppResult<C::Item> {
        codec.decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StringCodec;

    #[test]
    fn test_category_conversion() {
        for category in [
            MessageCategory::Message,
            MessageCategory::Request,
            MessageCategory::Response,
            MessageCategory::Heartbeat,
        ] {
            assert_eq!(MessageCategory::try_from(category as u8).unwrap(), category);
        }
        assert!(MessageCategory::try_from(7).is_err());
    }

    #[test]
    fn test_response_keeps_request_id() {
        let request = MessageMeta::request(12, 99);
        let response = MessageMeta::response_to(&request, 13, false);
        assert_eq!(response.request_id, 99);
        assert_eq!(response.category, MessageCategory::Response);
        assert!(!response.last);
    }

    #[test]
    fn test_heartbeat_probe_and_pong() {
        assert!(MessageMeta::heartbeat(false).is_heartbeat_probe());
        let pong = MessageMeta::heartbeat(true);
        assert!(pong.is_heartbeat());
        assert!(!pong.is_heartbeat_probe());
    }

    #[test]
    fn test_encode_with_codec() {
        let message =
            Message::encode(MessageMeta::message(1), &StringCodec, &"hello".to_string()).unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"hello"));
        assert_eq!(message.decode_payload(&StringCodec).unwrap(), "hello");
    }
}
