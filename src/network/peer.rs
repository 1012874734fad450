use std::any::{type_name, Any};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use super::{
    ConnectionData, Connector, ConnectorWriter, IoStats, IoStatsSnapshot, PeerState, TcpPeerHandler,
    TcpState,
};
use crate::protocol::{
    Message, Protocol, ProtocolHead, WebSocketHandshake, DEFAULT_MAX_HANDSHAKE_SIZE,
    HANDSHAKE_HEAD_END,
};
use crate::{AppError, AppResult};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Expect a WebSocket upgrade request before the first frame.
    pub websocket: bool,
    pub handshake_delimiter: Bytes,
    pub max_handshake_size: usize,
    pub read_buffer_size: usize,
    pub no_delay: bool,
    pub connect_timeout: Option<Duration>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        PeerOptions {
            websocket: false,
            handshake_delimiter: Bytes::from_static(HANDSHAKE_HEAD_END),
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            read_buffer_size: 4 * 1024,
            no_delay: true,
            connect_timeout: None,
        }
    }
}

enum WriteCommand {
    Data(Bytes),
    Close,
}

struct PeerInner {
    id: u64,
    state: TcpState,
    stats: Arc<IoStats>,
    runtime: Handle,
    handler: Weak<dyn TcpPeerHandler>,
    head: Arc<dyn ProtocolHead>,
    options: PeerOptions,
    peer_addr: Mutex<Option<SocketAddr>>,
    data: Mutex<Option<ConnectionData>>,

    write_tx: mpsc::UnboundedSender<WriteCommand>,
    // taken by the write task once a socket is attached
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteCommand>>>,
    // websocket only: the writer holds queued data until this reply is sent
    handshake_reply: Mutex<Option<oneshot::Sender<Bytes>>>,
    read_cancel: CancellationToken,
    write_abort: CancellationToken,
    connecting: AtomicBool,
    tasks_alive: AtomicU8,
    close_reason: Mutex<Option<AppError>>,
    close_notified: AtomicBool,
}

/// One TCP (or WebSocket-upgraded) connection.
///
/// A `TcpPeer` is a cheap handle; the receive and write tasks each own a
/// clone, so the connection state outlives every in-flight I/O operation
/// and is released once both tasks exit and the owner drops its handle.
///
/// Receive pipeline: `read head -> decode body size -> read body ->
/// on_read -> read head`, one read pending at a time. Send pipeline:
/// `async_send` queues bytes, the write task drains them in order.
#[derive(Clone)]
pub struct TcpPeer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("peer_addr", &*self.inner.peer_addr.lock())
            .finish()
    }
}

impl TcpPeer {
    /// Creates a peer in `connecting` state. Nothing runs until
    /// [`accept`](Self::accept), [`attach`](Self::attach) or
    /// [`async_connect`](Self::async_connect) hands it a socket.
    pub fn make(
        runtime: Handle,
        handler: Weak<dyn TcpPeerHandler>,
        head: Arc<dyn ProtocolHead>,
        options: PeerOptions,
    ) -> TcpPeer {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        TcpPeer {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                state: TcpState::default(),
                stats: Arc::new(IoStats::default()),
                runtime,
                handler,
                head,
                options,
                peer_addr: Mutex::new(None),
                data: Mutex::new(None),
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
                handshake_reply: Mutex::new(None),
                read_cancel: CancellationToken::new(),
                write_abort: CancellationToken::new(),
                connecting: AtomicBool::new(false),
                tasks_alive: AtomicU8::new(0),
                close_reason: Mutex::new(None),
                close_notified: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> PeerState {
        self.inner.state.get()
    }

    pub fn tcp_state(&self) -> &TcpState {
        &self.inner.state
    }

    pub fn set_peer_live(&self, live: bool) {
        self.inner.state.set_peer_live(live);
    }

    pub fn set_peer_active(&self, active: bool) {
        self.inner.state.set_peer_active(active);
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer_addr.lock()
    }

    pub fn protocol_head(&self) -> &Arc<dyn ProtocolHead> {
        &self.inner.head
    }

    pub fn options(&self) -> &PeerOptions {
        &self.inner.options
    }

    pub fn handler(&self) -> Option<Arc<dyn TcpPeerHandler>> {
        self.inner.handler.upgrade()
    }

    /// Attaches connection-scoped state, replacing any previous value.
    pub fn set_data<T: Any + Send>(&self, data: T) {
        *self.inner.data.lock() = Some(Box::new(data));
    }

    pub fn take_data(&self) -> Option<ConnectionData> {
        self.inner.data.lock().take()
    }

    /// Runs `f` on the attached state if it is a `T`.
    pub fn with_data<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.data.lock();
        guard
            .as_mut()
            .and_then(|data| data.downcast_mut::<T>())
            .map(f)
    }

    /// Connects to `addr` in the background; the outcome reaches the
    /// handler as `on_connect` or as `on_close` with a `ConnectError`.
    pub fn async_connect(&self, addr: SocketAddr) {
        if self.state() != PeerState::Connecting || self.inner.connecting.swap(true, Ordering::AcqRel)
        {
            warn!("peer {} async_connect ignored in state {}", self.id(), self.state());
            return;
        }
        let peer = self.clone();
        let span = info_span!("peer", id = self.id(), %addr);
        self.inner.runtime.spawn(
            async move {
                let timeout = peer.inner.options.connect_timeout;
                let result = tokio::select! {
                    _ = peer.inner.read_cancel.cancelled() => None,
                    result = connect(addr, timeout) => Some(result),
                };
                match result {
                    Some(Ok(stream)) => peer.accept(stream),
                    Some(Err(err)) => {
                        error!("peer {} connect {} failed: {}", peer.id(), addr, err);
                        peer.inner.connecting.store(false, Ordering::Release);
                        peer.record_reason(err);
                        peer.inner.state.begin_closing();
                        peer.finish_close();
                    }
                    None => {
                        debug!("peer {} closed while connecting", peer.id());
                        peer.inner.connecting.store(false, Ordering::Release);
                        peer.finish_close();
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Starts the peer on an established TCP stream.
    pub fn accept(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(self.inner.options.no_delay) {
            warn!("peer {} set nodelay failed: {}", self.id(), e);
        }
        *self.inner.peer_addr.lock() = stream.peer_addr().ok();
        self.attach(stream);
    }

    /// Starts the peer on any duplex byte stream.
    ///
    /// Marks the peer live, notifies `on_connect`, then either waits for a
    /// WebSocket handshake or goes straight to `ready` and reads the
    /// first head. On a WebSocket peer, data sent before the handshake
    /// completes is written after the `101` reply, or dropped if the
    /// handshake fails.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.inner.connecting.store(false, Ordering::Release);
        // stored before leaving `connecting` so a later close always finds it
        let handshake_rx = if self.inner.options.websocket {
            let (tx, rx) = oneshot::channel();
            *self.inner.handshake_reply.lock() = Some(tx);
            Some(rx)
        } else {
            None
        };
        if !self
            .inner
            .state
            .transition(PeerState::Connecting, PeerState::Connected)
        {
            debug!("peer {} dropped stream in state {}", self.id(), self.state());
            self.finish_close();
            return;
        }
        let Some(write_rx) = self.inner.write_rx.lock().take() else {
            self.record_reason(AppError::IllegalStateError(
                "peer attached twice".to_string(),
            ));
            self.finish_close();
            return;
        };

        self.inner.state.set_peer_live(true);
        let (reader, writer) = tokio::io::split(stream);
        self.inner.tasks_alive.store(2, Ordering::Release);

        let span = info_span!("peer", id = self.id());
        let writer = ConnectorWriter::new(writer, self.inner.stats.clone());
        self.inner.runtime.spawn(
            self.clone()
                .run_writer(writer, write_rx, handshake_rx)
                .instrument(span.clone()),
        );

        match self.handler() {
            Some(handler) => handler.on_connect(self),
            None => self.notify_close(AppError::IllegalStateError(
                "peer handler dropped".to_string(),
            )),
        }

        let next = if self.inner.options.websocket {
            self.inner.state.set_websocket();
            PeerState::WebSocketHandshake
        } else {
            PeerState::Ready
        };
        if self.inner.state.transition(PeerState::Connected, next) {
            trace!("peer {} {}", self.id(), next);
        }

        let connector = Connector::new(
            reader,
            self.inner.options.read_buffer_size,
            self.inner.stats.clone(),
        );
        self.inner
            .runtime
            .spawn(self.clone().run_reader(connector).instrument(span));
    }

    /// Queues `data` for the write task. Send order is wire order.
    pub fn async_send(&self, data: Bytes) -> AppResult<()> {
        if self.inner.state.is_closing_or_closed() {
            return Err(AppError::PeerClosed(format!(
                "peer {} is {}",
                self.id(),
                self.state()
            )));
        }
        self.inner
            .write_tx
            .send(WriteCommand::Data(data))
            .map_err(|e| AppError::ChannelSendError(format!("peer {} write queue: {}", self.id(), e)))
    }

    pub fn async_send_message(&self, message: &Message, protocol: &dyn Protocol) -> AppResult<()> {
        let frame = protocol.encode(message)?;
        self.async_send(frame)
    }

    /// Graceful close: no new reads are issued, queued writes are flushed,
    /// then the socket is released and `on_close(None)` fires.
    pub fn close(&self) {
        self.begin_close(None);
    }

    /// Closes immediately, dropping queued writes, and reports `error`.
    pub fn notify_close(&self, error: AppError) {
        self.begin_close(Some(error));
    }

    fn record_reason(&self, error: AppError) {
        let mut reason = self.inner.close_reason.lock();
        if reason.is_none() {
            *reason = Some(error);
        }
    }

    /// Only the first close decides between flushing and aborting.
    fn begin_close(&self, error: Option<AppError>) {
        let Some(previous) = self.inner.state.begin_closing() else {
            return;
        };
        let abort = error.is_some();
        if let Some(error) = error {
            self.record_reason(error);
        }
        self.inner.read_cancel.cancel();
        if abort {
            self.inner.write_abort.cancel();
        }
        // a handshake that never finished releases the writer without a reply
        self.inner.handshake_reply.lock().take();
        if previous == PeerState::Connecting && !self.inner.connecting.load(Ordering::Acquire) {
            // no socket and no connect in flight
            self.finish_close();
        } else {
            let _ = self.inner.write_tx.send(WriteCommand::Close);
        }
    }

    fn task_exit(&self) {
        if self.inner.tasks_alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        self.inner.state.set(PeerState::Closed);
        self.inner.read_cancel.cancel();
        if self.inner.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = self.inner.close_reason.lock().take();
        match &reason {
            Some(err) => debug!("peer {} closed: {}", self.id(), err),
            None => debug!("peer {} closed", self.id()),
        }
        if let Some(handler) = self.handler() {
            handler.on_close(self, reason.as_ref());
        }
        self.inner.data.lock().take();
    }

    async fn run_writer<W>(
        self,
        mut writer: ConnectorWriter<W>,
        write_rx: mpsc::UnboundedReceiver<WriteCommand>,
        handshake_rx: Option<oneshot::Receiver<Bytes>>,
    ) where
        W: AsyncWrite + Unpin,
    {
        self.drain_writes(&mut writer, write_rx, handshake_rx).await;
        trace!("peer {} write task exit", self.id());
        self.task_exit();
    }

    async fn drain_writes<W>(
        &self,
        writer: &mut ConnectorWriter<W>,
        mut write_rx: mpsc::UnboundedReceiver<WriteCommand>,
        handshake_rx: Option<oneshot::Receiver<Bytes>>,
    ) where
        W: AsyncWrite + Unpin,
    {
        let abort = self.inner.write_abort.clone();
        if let Some(handshake_rx) = handshake_rx {
            let reply = tokio::select! {
                _ = abort.cancelled() => return,
                reply = handshake_rx => reply,
            };
            match reply {
                Ok(response) => {
                    if !self.write_data(writer, &abort, &response).await {
                        return;
                    }
                }
                Err(_) => {
                    debug!("peer {} handshake not completed, queued writes dropped", self.id());
                    if let Err(err) = writer.shutdown().await {
                        debug!("peer {} shutdown: {}", self.id(), err);
                    }
                    return;
                }
            }
        }
        loop {
            let command = tokio::select! {
                _ = abort.cancelled() => return,
                command = write_rx.recv() => command,
            };
            match command {
                Some(WriteCommand::Data(data)) => {
                    if !self.write_data(writer, &abort, &data).await {
                        return;
                    }
                }
                Some(WriteCommand::Close) | None => {
                    if let Err(err) = writer.shutdown().await {
                        debug!("peer {} shutdown: {}", self.id(), err);
                    }
                    return;
                }
            }
        }
    }

    /// Writes one buffer; `false` once the writer has to stop.
    async fn write_data<W>(
        &self,
        writer: &mut ConnectorWriter<W>,
        abort: &CancellationToken,
        data: &[u8],
    ) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        let result = tokio::select! {
            _ = abort.cancelled() => return false,
            result = writer.write(data) => result,
        };
        match result {
            Ok(n) => {
                if let Some(handler) = self.handler() {
                    handler.on_send(self, n);
                }
                true
            }
            Err(err) => {
                warn!("peer {} send failed: {}", self.id(), err);
                // also reported when a graceful close was flushing
                self.record_reason(err);
                self.inner.write_abort.cancel();
                self.begin_close(None);
                false
            }
        }
    }

    async fn run_reader<R>(self, mut connector: Connector<R>)
    where
        R: AsyncRead + Unpin,
    {
        let cancel = self.inner.read_cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.receive_loop(&mut connector) => result,
        };
        match result {
            Ok(()) => self.close(),
            Err(err) => {
                if err.is_protocol_violation() {
                    warn!("peer {} protocol violation: {}", self.id(), err);
                } else if err.is_transport() {
                    debug!("peer {} connection lost: {}", self.id(), err);
                } else {
                    warn!("peer {} recv failed: {}", self.id(), err);
                }
                self.notify_close(err);
            }
        }
        trace!("peer {} read task exit", self.id());
        self.task_exit();
    }

    /// Returns `Ok(())` when the remote closes between frames or the peer
    /// starts closing; any error closes the connection.
    async fn receive_loop<R>(&self, connector: &mut Connector<R>) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
    {
        if self.state() == PeerState::WebSocketHandshake {
            let options = &self.inner.options;
            let Some(request) = connector
                .read_until(&options.handshake_delimiter, options.max_handshake_size)
                .await?
            else {
                return Ok(());
            };
            self.handle_websocket_handshake(&request)?;
        }

        let head_size = self.inner.head.head_size();
        loop {
            let Some(head) = connector.read_head(head_size).await? else {
                return Ok(());
            };
            if self.inner.state.is_closing_or_closed() {
                return Ok(());
            }
            let body_size = self.inner.head.decode_data_size(&head)?;
            // any head from the remote proves it is alive
            self.inner.state.set_peer_live(true);

            let frame = if body_size == 0 {
                self.inner.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                head
            } else {
                let mut frame = BytesMut::with_capacity(head_size + body_size);
                frame.extend_from_slice(&head);
                connector.read_data(frame, body_size).await?
            };
            if self.inner.state.is_closing_or_closed() {
                return Ok(());
            }
            self.inner.state.set_peer_active(true);
            self.dispatch(frame.freeze())?;
        }
    }

    fn handle_websocket_handshake(&self, request: &[u8]) -> AppResult<()> {
        self.inner.state.set_peer_live(true);
        let handshake = WebSocketHandshake::parse(request)?;
        let reply_tx = self.inner.handshake_reply.lock().take();
        let sent = reply_tx.is_some_and(|tx| tx.send(handshake.response()).is_ok());
        if !sent || !self
            .inner
            .state
            .transition(PeerState::WebSocketHandshake, PeerState::Ready)
        {
            return Err(AppError::PeerClosed(format!(
                "peer {} closed during handshake",
                self.id()
            )));
        }
        debug!("peer {} websocket handshake done, path {}", self.id(), handshake.path);
        Ok(())
    }

    fn dispatch(&self, frame: Bytes) -> AppResult<()> {
        let handler = self
            .handler()
            .ok_or_else(|| AppError::IllegalStateError("peer handler dropped".to_string()))?;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_read(self, &frame))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!("peer {} handler failed on frame: {}", self.id(), err);
            }
            Err(payload) => {
                if let Some(message) = payload.downcast_ref::<&'static str>() {
                    error!("peer {} handler panicked with message: {}", self.id(), message);
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    error!("peer {} handler panicked with message: {}", self.id(), message);
                } else {
                    error!(
                        "peer {} handler panicked with an unknown type: {}",
                        self.id(),
                        type_name_of(&payload)
                    );
                }
            }
        }
        Ok(())
    }
}

fn type_name_of<T>(_: &T) -> &'static str {
    type_name::<T>()
}

pub(crate) async fn connect(addr: SocketAddr, timeout: Option<Duration>) -> AppResult<TcpStream> {
    let result = match timeout {
        Some(timeout) => time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AppError::ConnectError(format!("connect {} timed out", addr)))?,
        None => TcpStream::connect(addr).await,
    };
    result.map_err(|e| AppError::ConnectError(format!("connect {}: {}", addr, e)))
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        trace!("peer {} dropped", self.id);
    }
}
