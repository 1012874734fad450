use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::debug;

use crate::dispatch::{DispatchHandler, ResponseStream};
use crate::network::{self, PeerOptions, TcpPeer, TcpPeerHandler};
use crate::protocol::{Message, MessageMeta, Protocol};
use crate::{AppError, AppResult};

/// Outbound connection running the same peer runtime as the server side.
///
/// The client owns its `DispatchHandler`, so the peer's handler stays alive
/// for as long as the client does. Dropping the client closes the peer.
#[derive(Debug)]
pub struct TcpClient {
    peer: TcpPeer,
    handler: Arc<DispatchHandler>,
}

impl TcpClient {
    /// Connects to `addr` and starts the peer once the socket is up.
    pub async fn connect(
        addr: SocketAddr,
        handler: DispatchHandler,
        options: PeerOptions,
    ) -> AppResult<TcpClient> {
        let stream = network::connect(addr, options.connect_timeout).await?;
        let handler = Arc::new(handler);
        let peer_handler: Arc<dyn TcpPeerHandler> = handler.clone();
        let peer = TcpPeer::make(
            Handle::current(),
            Arc::downgrade(&peer_handler),
            handler.protocol().head(),
            options,
        );
        peer.accept(stream);
        debug!("client peer {} connected to {}", peer.id(), addr);
        Ok(TcpClient { peer, handler })
    }

    pub fn peer(&self) -> &TcpPeer {
        &self.peer
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        self.handler.protocol()
    }

    pub fn send(&self, message: &Message) -> AppResult<()> {
        self.peer
            .async_send_message(message, self.handler.protocol().as_ref())
    }

    /// Fire-and-forget message, no response expected.
    pub fn send_message(&self, message_type: u32, payload: Bytes) -> AppResult<()> {
        self.send(&Message::new(MessageMeta::message(message_type), payload))
    }

    /// Sends a request and returns the stream its response parts arrive on.
    pub fn request(&self, message_type: u32, payload: Bytes) -> AppResult<ResponseStream> {
        let correlator = self.handler.correlator();
        let peer_id = self.peer.id();
        let (request_id, stream) = correlator.register(peer_id);
        let request = Message::new(MessageMeta::request(message_type, request_id), payload);
        if let Err(err) = self.send(&request) {
            correlator.cancel(peer_id, request_id);
            return Err(err);
        }
        Ok(stream)
    }

    /// Sends a request and waits for its last response part.
    pub async fn call(&self, message_type: u32, payload: Bytes) -> AppResult<Message> {
        let parts = self.request(message_type, payload)?.collect().await?;
        parts.into_iter().last().ok_or_else(|| {
            AppError::IllegalStateError(format!("no response to message type {}", message_type))
        })
    }

    pub fn close(&self) {
        self.peer.close();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.peer.close();
    }
}
