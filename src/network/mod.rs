//! Network Module Implementation
//!
//! This module holds the per-connection runtime: the peer state machine,
//! the connector that turns a byte stream into heads and bodies, and the
//! handler contract through which decoded frames and lifecycle events
//! leave the core.
//!
//! # Architecture
//!
//! The network module is built on tokio's async I/O primitives:
//! - `Connector` / `ConnectorWriter`: partial-read accumulation and flushed writes
//! - `TcpPeer`: `connecting -> connected -> (websocket_handshake) -> ready -> closing -> closed`
//! - `TcpPeerHandler`: `on_connect`, `on_read`, `on_send`, `on_close`
//! - `PeerPool`: the set of live peers shared by servers and the liveness monitor
//!
//! Each peer runs one receive task and one write task. Reads are strictly
//! sequential; writes drain a FIFO queue, so send order is wire order.

pub use connector::{Connector, ConnectorWriter, IoStats, IoStatsSnapshot};
pub use handler::{ConnectionData, TcpPeerHandler};
pub(crate) use peer::connect;
pub use peer::{PeerOptions, TcpPeer};
pub use pool::PeerPool;
pub use state::{PeerState, TcpState};

mod connector;
mod handler;
mod peer;
mod pool;
mod state;
