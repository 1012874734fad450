use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::{Context, DispatchRegistry, RequestCorrelator};
use crate::network::{TcpPeer, TcpPeerHandler};
use crate::protocol::{Message, MessageCategory, MessageMeta, Protocol};
use crate::{AppError, AppResult};

type ConnectHook = Box<dyn Fn(&TcpPeer) + Send + Sync>;
type CloseHook = Box<dyn Fn(&TcpPeer, Option<&AppError>) + Send + Sync>;

/// Peer handler that decodes frames with a [`Protocol`] and routes them.
///
/// Heartbeat probes are answered in place, responses go to the
/// [`RequestCorrelator`], everything else to the [`DispatchRegistry`].
/// Responses nobody waits for fall through to the registry as well.
/// One handler may serve many peers; requests are tracked per peer.
pub struct DispatchHandler {
    protocol: Arc<dyn Protocol>,
    registry: DispatchRegistry,
    correlator: Arc<RequestCorrelator>,
    on_connect: Option<ConnectHook>,
    on_close: Option<CloseHook>,
}

impl std::fmt::Debug for DispatchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandler")
            .field("protocol", &self.protocol)
            .field("registry", &self.registry)
            .field("pending", &self.correlator.pending())
            .finish()
    }
}

impl DispatchHandler {
    pub fn new(protocol: Arc<dyn Protocol>, registry: DispatchRegistry) -> Self {
        DispatchHandler {
            protocol,
            registry,
            correlator: Arc::new(RequestCorrelator::new()),
            on_connect: None,
            on_close: None,
        }
    }

    pub fn with_connect_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TcpPeer) + Send + Sync + 'static,
    {
        self.on_connect = Some(Box::new(hook));
        self
    }

    pub fn with_close_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TcpPeer, Option<&AppError>) + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    fn answer_probe(&self, peer: &TcpPeer) -> AppResult<()> {
        trace!("peer {} heartbeat probe", peer.id());
        let pong = Message::new(MessageMeta::heartbeat(true), Bytes::new());
        peer.async_send_message(&pong, self.protocol.as_ref())
    }
}

impl TcpPeerHandler for DispatchHandler {
    fn on_connect(&self, peer: &TcpPeer) {
        if let Some(hook) = &self.on_connect {
            hook(peer);
        }
    }

    fn on_read(&self, peer: &TcpPeer, frame: &Bytes) -> AppResult<()> {
        let message = self.protocol.decode(frame)?;
        match message.meta.category {
            MessageCategory::Heartbeat => {
                if message.meta.is_heartbeat_probe() {
                    self.answer_probe(peer)?;
                }
                Ok(())
            }
            MessageCategory::Response => match self.correlator.complete(peer.id(), message) {
                None => Ok(()),
                Some(message) => {
                    debug!(
                        "peer {} unsolicited response {}",
                        peer.id(),
                        message.meta.request_id
                    );
                    let ctx = Context::new(peer, message, self.protocol.as_ref());
                    self.registry.dispatch(&ctx)
                }
            },
            MessageCategory::Message | MessageCategory::Request => {
                let ctx = Context::new(peer, message, self.protocol.as_ref());
                self.registry.dispatch(&ctx)
            }
        }
    }

    fn on_close(&self, peer: &TcpPeer, error: Option<&AppError>) {
        if self.correlator.pending_on(peer.id()) > 0 {
            let reason = match error {
                Some(err) => format!("peer {} closed: {}", peer.id(), err),
                None => format!("peer {} closed", peer.id()),
            };
            self.correlator.fail_peer(peer.id(), &reason);
        }
        if let Some(hook) = &self.on_close {
            hook(peer, error);
        }
    }
}
