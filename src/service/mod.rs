pub use app::ServerApp;
pub use app_error::{AppError, AppResult};
pub use client::TcpClient;
pub use config::{
    HeadKind, HeartbeatConfig, NetworkConfig, ProtocolConfig, RuntimeConfig, TcpeerConfig,
};
pub use heartbeat::{HeartbeatProbe, LivenessMonitor, ProtocolHeartbeat, TickReport};
pub use server::TcpServer;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app;
mod app_error;
mod client;
mod config;
mod heartbeat;
mod server;
mod shutdown;
mod tracing_config;
