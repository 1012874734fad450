use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::network::{PeerOptions, PeerPool, TcpPeer, TcpPeerHandler};
use crate::protocol::ProtocolHead;
use crate::{AppError, AppResult};

use super::Shutdown;

/// Keeps the server's pool in step with peer lifecycles, then hands every
/// event to the application handler.
struct ServerHandler {
    inner: Arc<dyn TcpPeerHandler>,
    pool: Arc<PeerPool>,
}

impl TcpPeerHandler for ServerHandler {
    fn on_connect(&self, peer: &TcpPeer) {
        self.inner.on_connect(peer);
    }

    fn on_read(&self, peer: &TcpPeer, frame: &Bytes) -> AppResult<()> {
        self.inner.on_read(peer, frame)
    }

    fn on_send(&self, peer: &TcpPeer, bytes_written: usize) {
        self.inner.on_send(peer, bytes_written);
    }

    fn on_close(&self, peer: &TcpPeer, error: Option<&AppError>) {
        self.inner.on_close(peer, error);
        // releases the connection permit
        self.pool.remove(peer.id());
    }
}

/// Accepts TCP connections and runs one [`TcpPeer`] per connection.
///
/// The number of concurrent peers is bounded by `limit_connections`; a
/// permit lives in the pool entry and returns when the peer closes.
pub struct TcpServer {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    pool: Arc<PeerPool>,
    handler: Arc<ServerHandler>,
    head: Arc<dyn ProtocolHead>,
    options: PeerOptions,
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("listener", &self.listener)
            .field("pool", &self.pool)
            .field("head", &self.head)
            .finish()
    }
}

impl TcpServer {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: Arc<dyn TcpPeerHandler>,
        head: Arc<dyn ProtocolHead>,
        options: PeerOptions,
    ) -> Self {
        let pool = Arc::new(PeerPool::new());
        TcpServer {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            handler: Arc::new(ServerHandler {
                inner: handler,
                pool: pool.clone(),
            }),
            pool,
            head,
            options,
        }
    }

    pub async fn bind(
        listen_address: &str,
        max_connection: usize,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: Arc<dyn TcpPeerHandler>,
        head: Arc<dyn ProtocolHead>,
        options: PeerOptions,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!("tcp server binding to {} for listening", listen_address);
        Ok(TcpServer::new(
            listener,
            Arc::new(Semaphore::new(max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            handler,
            head,
            options,
        ))
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn pool(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    /// Accepts connections until shutdown is broadcast.
    ///
    /// Shutdown sequence:
    /// 1. The accept loop stops on the shutdown signal (or when the caller
    ///    drops this future).
    /// 2. A watcher closes every pooled peer gracefully, so queued writes
    ///    still reach the wire.
    /// 3. Once the pool is empty the watcher drops its `shutdown_complete_tx`
    ///    and the handler, letting the owner finish waiting.
    ///
    /// Returns an error only when accepting keeps failing after backoff.
    pub async fn run(&self) -> AppResult<()> {
        self.spawn_shutdown_watcher();
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let handler: Arc<dyn TcpPeerHandler> = self.handler.clone();
        let handler: Weak<dyn TcpPeerHandler> = Arc::downgrade(&handler);

        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => permit
                    .map_err(|e| AppError::IllegalStateError(format!("connection limit closed: {}", e)))?,
                _ = shutdown.recv() => break,
            };

            let (socket, addr) = tokio::select! {
                res = self.accept() => res?,
                _ = shutdown.recv() => break,
            };
            debug!("accept new connection from {}", addr);

            let peer = TcpPeer::make(
                Handle::current(),
                handler.clone(),
                self.head.clone(),
                self.options.clone(),
            );
            // pooled before it starts so on_close always finds it
            self.pool.insert(peer.clone(), Some(permit));
            peer.accept(socket);
            // the shutdown sweep may have run before this insert
            if self.pool.is_closing() {
                debug!("peer {} accepted during shutdown", peer.id());
                peer.close();
                break;
            }
        }
        debug!("tcp server exit accept loop");
        Ok(())
    }

    fn spawn_shutdown_watcher(&self) {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let pool = self.pool.clone();
        let handler = self.handler.clone();
        let shutdown_complete_tx = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            shutdown.recv().await;
            info!("closing {} peers", pool.len());
            pool.close_all();
            pool.wait_empty().await;
            debug!("all peers closed");
            drop(handler);
            drop(shutdown_complete_tx);
        });
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    error!("accept failed, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
