pub mod dispatch;
pub mod network;
pub mod protocol;
pub mod service;

pub use dispatch::{DispatchHandler, DispatchRegistry};
pub use network::{PeerOptions, PeerPool, PeerState, TcpPeer, TcpPeerHandler};
pub use protocol::{Message, MessageMeta, Protocol, ProtocolHead, TcpProtocol};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ServerApp, Shutdown, TcpClient,
    TcpServer, TcpeerConfig,
};
