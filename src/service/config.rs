extern crate config as _;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::PeerOptions;
use crate::protocol::{
    LengthPrefixHead, ProtocolHead, TcpProtocol, TcpProtocolHead, DEFAULT_MAX_HANDSHAKE_SIZE,
};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub no_delay: bool,
    /// 0 disables the connect timeout.
    pub connect_timeout_ms: u64,
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9600,
            max_connection: 1024,
            no_delay: true,
            connect_timeout_ms: 3000,
            read_buffer_size: 4 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadKind {
    /// `TcpProtocolHead`, the head understood by `TcpProtocol`.
    Tcp,
    /// Bare length prefix of `head_size` bytes.
    Length,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProtocolConfig {
    pub head: HeadKind,
    /// Width of the length prefix, only read for `head = "length"`.
    pub head_size: usize,
    pub max_frame_size: usize,
    pub websocket: bool,
    pub handshake_delimiter: String,
    pub max_handshake_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            head: HeadKind::Tcp,
            head_size: 4,
            max_frame_size: 4 * 1024 * 1024,
            websocket: false,
            handshake_delimiter: "\r\n\r\n".to_string(),
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
        }
    }
}

impl ProtocolConfig {
    pub fn build_head(&self) -> AppResult<Arc<dyn ProtocolHead>> {
        match self.head {
            HeadKind::Tcp => Ok(Arc::new(TcpProtocolHead::new(self.max_frame_size))),
            HeadKind::Length => Ok(Arc::new(LengthPrefixHead::new(
                self.head_size,
                self.max_frame_size,
            )?)),
        }
    }

    pub fn build_protocol(&self) -> TcpProtocol {
        TcpProtocol::new(self.max_frame_size)
    }
}

/// Liveness policy applied by the monitor; the peer itself only keeps flags.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub tick_interval_ms: u64,
    /// Consecutive ticks without any inbound frame before a peer is closed.
    pub max_idle_ticks: u32,
    pub send_probe: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            tick_interval_ms: 5000,
            max_idle_ticks: 3,
            send_probe: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 0 means one worker per cpu.
    pub worker_threads: usize,
}

impl RuntimeConfig {
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TcpeerConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub heartbeat: HeartbeatConfig,
    pub runtime: RuntimeConfig,
}

impl TcpeerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TcpeerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let tcpeer_config: TcpeerConfig = config.try_deserialize()?;
        tcpeer_config.validate()?;
        Ok(tcpeer_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.protocol.max_frame_size == 0 {
            return Err(AppError::InvalidValue(
                "protocol.max_frame_size must be positive".to_string(),
            ));
        }
        if self.protocol.handshake_delimiter.is_empty() {
            return Err(AppError::InvalidValue(
                "protocol.handshake_delimiter must not be empty".to_string(),
            ));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".to_string(),
            ));
        }
        self.protocol.build_head().map(|_| ())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }

    pub fn peer_options(&self) -> PeerOptions {
        let connect_timeout = match self.network.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        PeerOptions {
            websocket: self.protocol.websocket,
            handshake_delimiter: Bytes::from(self.protocol.handshake_delimiter.clone().into_bytes()),
            max_handshake_size: self.protocol.max_handshake_size,
            read_buffer_size: self.network.read_buffer_size,
            no_delay: self.network.no_delay,
            connect_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TcpeerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.protocol.build_head().unwrap().head_size(), 8);
        let options = config.peer_options();
        assert_eq!(&options.handshake_delimiter[..], b"\r\n\r\n");
        assert_eq!(options.connect_timeout, Some(Duration::from_millis(3000)));
    }

    #[test]
    fn test_length_head_width() {
        let mut config = TcpeerConfig::default();
        config.protocol.head = HeadKind::Length;
        config.protocol.head_size = 2;
        assert_eq!(config.protocol.build_head().unwrap().head_size(), 2);
        config.protocol.head_size = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_threads_default() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.worker_threads(), num_cpus::get());
        let runtime = RuntimeConfig { worker_threads: 2 };
        assert_eq!(runtime.worker_threads(), 2);
    }
}
