#![allow(dead_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rstest::fixture;
use tcpeer::network::{PeerOptions, TcpPeer, TcpPeerHandler};
use tcpeer::protocol::{LengthPrefixHead, ProtocolHead};
use tcpeer::{setup_local_tracing, AppError, AppResult};
use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub const MAX_FRAME: usize = 1024;

pub struct Logging;

/// Console tracing for the whole test binary, filtered by `RUST_LOG`.
#[fixture]
#[once]
pub fn logging() -> Logging {
    setup_local_tracing().unwrap();
    Logging
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Io,
    Malformed,
    TooLarge,
    Connect,
    Heartbeat,
    Other,
}

impl CloseKind {
    fn of(error: &AppError) -> CloseKind {
        match error {
            AppError::IoError(_) | AppError::DetailedIoError(_) => CloseKind::Io,
            AppError::MalformedProtocol(_) => CloseKind::Malformed,
            AppError::MessageTooLarge(_) => CloseKind::TooLarge,
            AppError::ConnectError(_) => CloseKind::Connect,
            AppError::HeartbeatTimeout(_) => CloseKind::Heartbeat,
            _ => CloseKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(u64),
    Read(Bytes),
    Send(usize),
    Close(Option<CloseKind>),
}

/// Forwards every callback to a channel. Frames ending in `fail` make
/// `on_read` return an error, frames ending in `panic` make it panic.
pub struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { events }), rx)
    }
}

impl TcpPeerHandler for Recorder {
    fn on_connect(&self, peer: &TcpPeer) {
        let _ = self.events.send(Event::Connect(peer.id()));
    }

    fn on_read(&self, _peer: &TcpPeer, frame: &Bytes) -> AppResult<()> {
        if frame.ends_with(b"fail") {
            return Err(AppError::HandlerError("refused".to_string()));
        }
        if frame.ends_with(b"panic") {
            panic!("handler blew up");
        }
        let _ = self.events.send(Event::Read(frame.clone()));
        Ok(())
    }

    fn on_send(&self, _peer: &TcpPeer, bytes_written: usize) {
        let _ = self.events.send(Event::Send(bytes_written));
    }

    fn on_close(&self, _peer: &TcpPeer, error: Option<&AppError>) {
        let _ = self.events.send(Event::Close(error.map(CloseKind::of)));
    }
}

pub fn length_head() -> Arc<dyn ProtocolHead> {
    Arc::new(LengthPrefixHead::new(4, MAX_FRAME).unwrap())
}

/// `[i32 length][body]`, the frame layout of `length_head`.
pub fn length_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_i32(body.len() as i32);
    buf.put_slice(body);
    buf.freeze()
}

pub fn new_peer(handler: &Arc<Recorder>, head: Arc<dyn ProtocolHead>, options: PeerOptions) -> TcpPeer {
    let handler: Arc<dyn TcpPeerHandler> = handler.clone();
    let weak: Weak<dyn TcpPeerHandler> = Arc::downgrade(&handler);
    TcpPeer::make(Handle::current(), weak, head, options)
}

/// A running peer on one end of an in-memory duplex pipe.
pub fn peer_on_duplex(
    options: PeerOptions,
) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>, TcpPeer, DuplexStream) {
    let (recorder, events) = Recorder::new();
    let peer = new_peer(&recorder, length_head(), options);
    let (local, remote) = tokio::io::duplex(64 * 1024);
    peer.attach(local);
    (recorder, events, peer, remote)
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a peer event")
        .expect("event channel closed")
}

/// Next event that is not an `on_send` notification.
pub async fn next_non_send(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    loop {
        match next_event(events).await {
            Event::Send(_) => continue,
            event => return event,
        }
    }
}
