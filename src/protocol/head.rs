use std::fmt::Debug;

use bytes::{Buf, BufMut, BytesMut};

use super::MessageCategory;
use crate::{AppError, AppResult};

/// A fixed-size header declaring how many body bytes follow it.
///
/// `head_size` is constant for the lifetime of the head, so the receive
/// loop always knows how many bytes to read before it can decode the
/// body length.
pub trait ProtocolHead: Send + Sync + Debug {
    fn head_size(&self) -> usize;

    fn max_frame_size(&self) -> usize;

    /// Decodes the body length from exactly `head_size` bytes.
    ///
    /// Fails with `MalformedProtocol` when the length field is unusable and
    /// with `MessageTooLarge` when it exceeds `max_frame_size`.
    fn decode_data_size(&self, head: &[u8]) -> AppResult<usize>;

    /// Writes a head announcing `body_size` bytes into `dst`.
    fn encode_head(&self, body_size: usize, dst: &mut BytesMut) -> AppResult<()>;
}

fn check_head_len(head: &[u8], head_size: usize) -> AppResult<()> {
    if head.len() != head_size {
        return Err(AppError::MalformedProtocol(format!(
            "head of {} bytes, expected {}",
            head.len(),
            head_size
        )));
    }
    Ok(())
}

fn check_frame_size(body_size: usize, max_frame_size: usize) -> AppResult<usize> {
    if body_size > max_frame_size {
        return Err(AppError::MessageTooLarge(format!(
            "frame of length {} is too large, max {}",
            body_size, max_frame_size
        )));
    }
    Ok(body_size)
}

/// Plain big-endian signed length prefix of 2, 4 or 8 bytes.
#[derive(Debug, Clone)]
pub struct LengthPrefixHead {
    width: usize,
    max_frame_size: usize,
}

impl LengthPrefixHead {
    pub fn new(width: usize, max_frame_size: usize) -> AppResult<Self> {
        match width {
            2 | 4 | 8 => Ok(LengthPrefixHead {
                width,
                max_frame_size,
            }),
            _ => Err(AppError::InvalidValue(format!(
                "length prefix width {} not in (2, 4, 8)",
                width
            ))),
        }
    }
}

impl ProtocolHead for LengthPrefixHead {
    fn head_size(&self) -> usize {
        self.width
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_data_size(&self, head: &[u8]) -> AppResult<usize> {
        check_head_len(head, self.width)?;
        let mut buf = head;
        let body_size = match self.width {
            2 => buf.get_i16() as i64,
            4 => buf.get_i32() as i64,
            _ => buf.get_i64(),
        };
        if body_size < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} less than 0",
                body_size
            )));
        }
        let body_size = usize::try_from(body_size).map_err(|_| {
            AppError::MessageTooLarge(format!("frame of length {} is too large", body_size))
        })?;
        check_frame_size(body_size, self.max_frame_size)
    }

    fn encode_head(&self, body_size: usize, dst: &mut BytesMut) -> AppResult<()> {
        check_frame_size(body_size, self.max_frame_size)?;
        let too_large =
            || AppError::MessageTooLarge(format!("frame of length {} overflows head", body_size));
        match self.width {
            2 => dst.put_i16(i16::try_from(body_size).map_err(|_| too_large())?),
            4 => dst.put_i32(i32::try_from(body_size).map_err(|_| too_large())?),
            _ => dst.put_i64(i64::try_from(body_size).map_err(|_| too_large())?),
        }
        Ok(())
    }
}

pub const TCP_PROTOCOL_VERSION: u8 = 1;
pub const TCP_HEAD_SIZE: usize = 8;

pub(crate) const FLAG_LAST: u8 = 0x10;
pub(crate) const FLAG_ERROR: u8 = 0x20;
const CATEGORY_MASK: u8 = 0x0f;

/// Fields carried inline by [`TcpProtocolHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeadFields {
    pub category: MessageCategory,
    pub last: bool,
    pub error: bool,
    pub body_size: usize,
}

/// The framework head: `[version][category][reserved u16][body_size u32]`.
#[derive(Debug, Clone)]
pub struct TcpProtocolHead {
    max_frame_size: usize,
}

impl TcpProtocolHead {
    pub fn new(max_frame_size: usize) -> Self {
        TcpProtocolHead { max_frame_size }
    }

    pub fn decode_fields(&self, head: &[u8]) -> AppResult<TcpHeadFields> {
        check_head_len(head, TCP_HEAD_SIZE)?;
        let mut buf = head;
        let version = buf.get_u8();
        if version != TCP_PROTOCOL_VERSION {
            return Err(AppError::MalformedProtocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let flags = buf.get_u8();
        let category = MessageCategory::try_from(flags & CATEGORY_MASK)?;
        let _reserved = buf.get_u16();
        let body_size = check_frame_size(buf.get_u32() as usize, self.max_frame_size)?;
        Ok(TcpHeadFields {
            category,
            last: flags & FLAG_LAST != 0,
            error: flags & FLAG_ERROR != 0,
            body_size,
        })
    }

    pub fn encode_fields(&self, fields: &TcpHeadFields, dst: &mut BytesMut) -> AppResult<()> {
        check_frame_size(fields.body_size, self.max_frame_size)?;
        let body_size = u32::try_from(fields.body_size).map_err(|_| {
            AppError::MessageTooLarge(format!(
                "frame of length {} overflows head",
                fields.body_size
            ))
        })?;
        let mut flags = fields.category as u8;
        if fields.last {
            flags |= FLAG_LAST;
        }
        if fields.error {
            flags |= FLAG_ERROR;
        }
        dst.reserve(TCP_HEAD_SIZE);
        dst.put_u8(TCP_PROTOCOL_VERSION);
        dst.put_u8(flags);
        dst.put_u16(0);
        dst.put_u32(body_size);
        Ok(())
    }
}

impl ProtocolHead for TcpProtocolHead {
    fn head_size(&self) -> usize {
        TCP_HEAD_SIZE
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_data_size(&self, head: &[u8]) -> AppResult<usize> {
        self.decode_fields(head).map(|fields| fields.body_size)
    }

    fn encode_head(&self, body_size: usize, dst: &mut BytesMut) -> AppResult<()> {
        let fields = TcpHeadFields {
            category: MessageCategory::Message,
            last: true,
            error: false,
            body_size,
        };
        self.encode_fields(&fields, dst)
    }
}
