use bytes::{BufMut, Bytes, BytesMut};
use tungstenite::handshake::derive_accept_key;

use crate::{AppError, AppResult};

pub const HANDSHAKE_HEAD_END: &[u8] = b"\r\n\r\n";
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 4096;

/// A parsed WebSocket upgrade request.
///
/// The handshake is a text head: it has no fixed size and ends at the
/// header delimiter, so it is read with "read until" rather than as a
/// fixed head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketHandshake {
    pub path: String,
    pub host: Option<String>,
    pub key: String,
    pub protocol: Option<String>,
}

impl WebSocketHandshake {
    pub fn parse(data: &[u8]) -> AppResult<WebSocketHandshake> {
        if !data.starts_with(b"GET ") {
            return Err(AppError::MalformedProtocol(
                "websocket handshake invalid 'GET '".to_string(),
            ));
        }
        let text = std::str::from_utf8(data).map_err(|_| {
            AppError::MalformedProtocol("websocket handshake is not utf-8".to_string())
        })?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (_method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version)) => (method, path, version),
            _ => {
                return Err(AppError::MalformedProtocol(format!(
                    "bad request line: {}",
                    request_line
                )))
            }
        };
        if version != "HTTP/1.1" {
            return Err(AppError::MalformedProtocol(format!(
                "unsupported http version {}",
                version
            )));
        }

        let mut upgrade = false;
        let mut connection_upgrade = false;
        let mut version_13 = false;
        let mut key = None;
        let mut host = None;
        let mut protocol = None;
        for line in lines.take_while(|line| !line.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                AppError::MalformedProtocol(format!("bad header line: {}", line))
            })?;
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "upgrade" => upgrade = value.eq_ignore_ascii_case("websocket"),
                "connection" => {
                    connection_upgrade = value
                        .split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
                }
                "sec-websocket-version" => version_13 = value == "13",
                "sec-websocket-key" => key = Some(value.to_string()),
                "sec-websocket-protocol" => {
                    protocol = value.split(',').next().map(|p| p.trim().to_string())
                }
                "host" => host = Some(value.to_string()),
                _ => {}
            }
        }

        if !upgrade || !connection_upgrade {
            return Err(AppError::MalformedProtocol(
                "websocket handshake misses upgrade headers".to_string(),
            ));
        }
        if !version_13 {
            return Err(AppError::MalformedProtocol(
                "websocket handshake requires version 13".to_string(),
            ));
        }
        let key = key.filter(|k| !k.is_empty()).ok_or_else(|| {
            AppError::MalformedProtocol("websocket handshake misses Sec-WebSocket-Key".to_string())
        })?;

        Ok(WebSocketHandshake {
            path: path.to_string(),
            host,
            key,
            protocol,
        })
    }

    pub fn accept_key(&self) -> String {
        derive_accept_key(self.key.as_bytes())
    }

    /// The `101 Switching Protocols` answer.
    pub fn response(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.put_slice(b"Upgrade: websocket\r\n");
        buf.put_slice(b"Connection: Upgrade\r\n");
        buf.put_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept_key()).as_bytes());
        if let Some(protocol) = &self.protocol {
            buf.put_slice(format!("Sec-WebSocket-Protocol: {}\r\n", protocol).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}
