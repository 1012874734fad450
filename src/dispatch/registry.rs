use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::network::TcpPeer;
use crate::protocol::{Codec, Message, MessageCategory, MessageMeta, Protocol};
use crate::{AppError, AppResult};

/// One decoded inbound message together with the peer it arrived on.
pub struct Context<'a> {
    peer: &'a TcpPeer,
    message: Message,
    protocol: &'a dyn Protocol,
}

impl<'a> Context<'a> {
    pub fn new(peer: &'a TcpPeer, message: Message, protocol: &'a dyn Protocol) -> Self {
        Context {
            peer,
            message,
            protocol,
        }
    }

    pub fn peer(&self) -> &TcpPeer {
        self.peer
    }

    pub fn meta(&self) -> &MessageMeta {
        &self.message.meta
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn decode<C: Codec>(&self, codec: &C) -> AppResult<C::Item> {
        self.message.decode_payload(codec)
    }

    /// Sends a message on the same peer.
    pub fn send(&self, message: &Message) -> AppResult<()> {
        self.peer.async_send_message(message, self.protocol)
    }

    /// Sends one response part for the current request; `last` ends the
    /// response.
    pub fn resp<C: Codec>(
        &self,
        message_type: u32,
        codec: &C,
        item: &C::Item,
        last: bool,
    ) -> AppResult<()> {
        let meta = self.response_meta(message_type, last)?;
        self.send(&Message::encode(meta, codec, item)?)
    }

    pub fn resp_bytes(&self, message_type: u32, payload: Bytes, last: bool) -> AppResult<()> {
        let meta = self.response_meta(message_type, last)?;
        self.send(&Message::new(meta, payload))
    }

    /// Terminal response carrying the error flag.
    pub fn resp_error(&self, message_type: u32, payload: Bytes) -> AppResult<()> {
        let meta = self.response_meta(message_type, true)?.with_error(true);
        self.send(&Message::new(meta, payload))
    }

    fn response_meta(&self, message_type: u32, last: bool) -> AppResult<MessageMeta> {
        if self.message.meta.category != MessageCategory::Request {
            return Err(AppError::InvalidValue(format!(
                "message type {} is not a request",
                self.message.meta.message_type
            )));
        }
        Ok(MessageMeta::response_to(
            &self.message.meta,
            message_type,
            last,
        ))
    }
}

pub type MessageHandler = Box<dyn Fn(&Context<'_>) -> AppResult<()> + Send + Sync>;

/// Routes inbound messages to handlers by message type.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<u32, MessageHandler>,
    default: Option<MessageHandler>,
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("DispatchRegistry")
            .field("types", &types)
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl DispatchRegistry {
    pub fn new() -> Self {
        DispatchRegistry::default()
    }

    /// Registers `handler` for `message_type`, replacing an earlier one.
    pub fn register<F>(&mut self, message_type: u32, handler: F) -> &mut Self
    where
        F: Fn(&Context<'_>) -> AppResult<()> + Send + Sync + 'static,
    {
        self.handlers.insert(message_type, Box::new(handler));
        self
    }

    /// Handler for every type without its own entry.
    pub fn set_default<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Context<'_>) -> AppResult<()> + Send + Sync + 'static,
    {
        self.default = Some(Box::new(handler));
        self
    }

    pub fn dispatch(&self, ctx: &Context<'_>) -> AppResult<()> {
        let message_type = ctx.meta().message_type;
        match self.handlers.get(&message_type).or(self.default.as_ref()) {
            Some(handler) => handler(ctx),
            None => Err(AppError::HandlerError(format!(
                "no handler for message type {}",
                message_type
            ))),
        }
    }
}
