use std::any::Any;

use bytes::Bytes;

use super::TcpPeer;
use crate::{AppError, AppResult};

/// Receives a peer's connection and message events.
///
/// Every callback runs on the peer's own task and must not block: the
/// receive loop issues its next read only after `on_read` returns.
/// A peer holds its handler weakly, the owner of the handler keeps it alive.
pub trait TcpPeerHandler: Send + Sync + 'static {
    fn on_connect(&self, _peer: &TcpPeer) {}

    /// One complete frame, head included.
    ///
    /// An `Err` (or a panic) is logged and the receive loop goes on;
    /// only transport and framing errors close the connection.
    fn on_read(&self, peer: &TcpPeer, frame: &Bytes) -> AppResult<()>;

    fn on_send(&self, _peer: &TcpPeer, _bytes_written: usize) {}

    /// Called exactly once per peer. `None` means an orderly close.
    fn on_close(&self, _peer: &TcpPeer, _error: Option<&AppError>) {}
}

/// Application state attached to one connection, dropped when it closes.
pub type ConnectionData = Box<dyn Any + Send>;
