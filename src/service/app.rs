use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::{runtime, signal};
use tracing::{error, info, trace};

use super::{HeartbeatProbe, LivenessMonitor, TcpServer, TcpeerConfig};
use crate::network::TcpPeerHandler;
use crate::AppResult;

/// Wires a [`TcpServer`] and a [`LivenessMonitor`] to one shutdown
/// broadcast and runs them until the shutdown signal.
#[derive(Debug)]
pub struct ServerApp {
    config: TcpeerConfig,
}

impl ServerApp {
    pub fn new(config: TcpeerConfig) -> Self {
        ServerApp { config }
    }

    pub fn config(&self) -> &TcpeerConfig {
        &self.config
    }

    /// Builds the runtime and serves until ctrl-c.
    pub fn start(
        &self,
        handler: Arc<dyn TcpPeerHandler>,
        probe: Option<Arc<dyn HeartbeatProbe>>,
    ) -> AppResult<()> {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(self.config.runtime.worker_threads())
            .thread_name("tcpeer-worker")
            .enable_all()
            .build()?;

        rt.block_on(self.serve(
            handler,
            probe,
            async {
                if let Err(err) = signal::ctrl_c().await {
                    error!("listen for ctrl-c failed: {}", err);
                }
            },
            None,
        ))
    }

    /// Serves on the current runtime until `shutdown_signal` resolves, then
    /// closes every peer and waits for the background tasks to finish.
    /// `bound` receives the listening address once the socket is bound.
    pub async fn serve<F>(
        &self,
        handler: Arc<dyn TcpPeerHandler>,
        probe: Option<Arc<dyn HeartbeatProbe>>,
        shutdown_signal: F,
        bound: Option<oneshot::Sender<SocketAddr>>,
    ) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let server = TcpServer::bind(
            &self.config.listen_address(),
            self.config.network.max_connection,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            handler,
            self.config.protocol.build_head()?,
            self.config.peer_options(),
        )
        .await?;
        if let Some(bound) = bound {
            let _ = bound.send(server.local_addr()?);
        }

        let monitor = LivenessMonitor::new(
            server.pool().clone(),
            self.config.heartbeat.clone(),
            probe,
        );
        monitor.start(notify_shutdown.clone(), shutdown_complete_tx.clone());

        tokio::select! {
            res = server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = shutdown_signal => {
                info!("get shutdown signal");
            }
        }

        // the monitor and the server's pool watcher are subscribed
        let _ = notify_shutdown.send(());
        drop(server);
        drop(shutdown_complete_tx);
        trace!("waiting for shutdown complete...");
        shutdown_complete_rx.recv().await;
        info!("server shutdown complete");
        Ok(())
    }
}
