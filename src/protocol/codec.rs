//! Payload codecs.
//!
//! The peer never looks inside a payload; a codec turns an application
//! value into bytes and back. Schema-driven codecs plug in here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

pub trait Codec: Send + Sync {
    type Item;

    fn encode(&self, item: &Self::Item, dst: &mut BytesMut) -> AppResult<()>;

    fn decode(&self, src: &[u8]) -> AppResult<Self::Item>;
}

/// Passes bytes through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> AppResult<()> {
        dst.put_slice(item);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> AppResult<Bytes> {
        Ok(Bytes::copy_from_slice(src))
    }
}

/// UTF-8 text payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn encode(&self, item: &String, dst: &mut BytesMut) -> AppResult<()> {
        dst.put_slice(item.as_bytes());
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> AppResult<String> {
        String::from_utf8(src.to_vec())
            .map_err(|e| AppError::MalformedProtocol(format!("payload is not utf-8: {}", e)))
    }
}
