use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{HeartbeatConfig, Shutdown};
use crate::network::{PeerPool, PeerState, TcpPeer};
use crate::protocol::{Message, MessageMeta, Protocol};
use crate::{AppError, AppResult};

/// Sends a keep-alive probe to an idle peer.
pub trait HeartbeatProbe: Send + Sync {
    fn probe(&self, peer: &TcpPeer) -> AppResult<()>;
}

/// Probes with an empty heartbeat message; the remote answers with a pong.
#[derive(Debug)]
pub struct ProtocolHeartbeat {
    protocol: Arc<dyn Protocol>,
}

impl ProtocolHeartbeat {
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        ProtocolHeartbeat { protocol }
    }
}

impl HeartbeatProbe for ProtocolHeartbeat {
    fn probe(&self, peer: &TcpPeer) -> AppResult<()> {
        let probe = Message::new(MessageMeta::heartbeat(false), Bytes::new());
        peer.async_send_message(&probe, self.protocol.as_ref())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub probed: usize,
    pub closed: usize,
}

/// Applies the liveness policy to every pooled peer once per tick.
///
/// A peer that delivered no head since the last tick gains an idle tick;
/// at `max_idle_ticks` it is closed with `HeartbeatTimeout`. A peer that
/// delivered no complete frame is probed. Both flags are cleared after
/// each check, so they always describe the last interval.
pub struct LivenessMonitor {
    pool: Arc<PeerPool>,
    config: HeartbeatConfig,
    probe: Option<Arc<dyn HeartbeatProbe>>,
}

impl LivenessMonitor {
    pub fn new(
        pool: Arc<PeerPool>,
        config: HeartbeatConfig,
        probe: Option<Arc<dyn HeartbeatProbe>>,
    ) -> Self {
        LivenessMonitor {
            pool,
            config,
            probe,
        }
    }

    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for peer in self.pool.snapshot() {
            if peer.state() < PeerState::Connected || peer.tcp_state().is_closing_or_closed() {
                continue;
            }
            report.checked += 1;
            let state = peer.tcp_state();

            if state.peer_live() {
                state.reset_idle_ticks();
            } else {
                let idle = state.add_idle_tick();
                if idle >= self.config.max_idle_ticks {
                    warn!("peer {} idle for {} ticks, closing", peer.id(), idle);
                    peer.notify_close(AppError::HeartbeatTimeout(idle));
                    report.closed += 1;
                    continue;
                }
            }

            if !state.peer_active() && state.is_ready() && self.config.send_probe {
                if let Some(probe) = &self.probe {
                    match probe.probe(&peer) {
                        Ok(()) => report.probed += 1,
                        Err(err) => debug!("peer {} probe failed: {}", peer.id(), err),
                    }
                }
            }

            peer.set_peer_live(false);
            peer.set_peer_active(false);
        }
        trace!("liveness tick {:?}", report);
        report
    }

    /// Ticks every `tick_interval` until shutdown is broadcast.
    pub fn start(
        self,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> JoinHandle<()> {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let mut interval = time::interval(self.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick();
                    }
                    _ = shutdown.recv() => {
                        info!("liveness monitor received shutdown signal");
                        break;
                    }
                }
            }
            drop(shutdown_complete_tx);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::time::Duration;

    use tokio::runtime::Handle;

    use super::*;
    use crate::network::{PeerOptions, TcpPeerHandler};
    use crate::protocol::TcpProtocolHead;

    #[derive(Default)]
    struct CountingProbe {
        sent: AtomicUsize,
    }

    impl HeartbeatProbe for CountingProbe {
        fn probe(&self, _peer: &TcpPeer) -> AppResult<()> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct CloseRecorder {
        closed: mpsc::UnboundedSender<Option<String>>,
    }

    impl TcpPeerHandler for CloseRecorder {
        fn on_read(&self, _peer: &TcpPeer, _frame: &Bytes) -> AppResult<()> {
            Ok(())
        }

        fn on_close(&self, _peer: &TcpPeer, error: Option<&AppError>) {
            let _ = self.closed.send(error.map(|e| e.to_string()));
        }
    }

    fn config(max_idle_ticks: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            tick_interval_ms: 10,
            max_idle_ticks,
            send_probe: true,
        }
    }

    #[tokio::test]
    async fn test_idle_peer_probed_then_closed() {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn TcpPeerHandler> = Arc::new(CloseRecorder { closed: closed_tx });
        let weak: Weak<dyn TcpPeerHandler> = Arc::downgrade(&handler);
        let peer = TcpPeer::make(
            Handle::current(),
            weak,
            Arc::new(TcpProtocolHead::new(1024)),
            PeerOptions::default(),
        );
        let (local, _remote) = tokio::io::duplex(1024);
        peer.attach(local);

        let pool = Arc::new(PeerPool::new());
        pool.insert(peer.clone(), None);
        let probe = Arc::new(CountingProbe::default());
        let monitor = LivenessMonitor::new(pool.clone(), config(2), Some(probe.clone()));

        // attach marks the peer live, so the first tick only probes
        let report = monitor.tick();
        assert_eq!(report.checked, 1);
        assert_eq!(report.probed, 1);
        assert_eq!(peer.tcp_state().idle_ticks(), 0);
        assert!(!peer.tcp_state().peer_live());

        let report = monitor.tick();
        assert_eq!(report.probed, 1);
        assert_eq!(peer.tcp_state().idle_ticks(), 1);

        let report = monitor.tick();
        assert_eq!(report.closed, 1);
        assert_eq!(probe.sent.load(Ordering::Relaxed), 2);

        let reason = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reason.unwrap().contains("heartbeat timeout"));
    }

    #[tokio::test]
    async fn test_live_peer_resets_idle_ticks() {
        let handler: Arc<dyn TcpPeerHandler> = Arc::new(CloseRecorder {
            closed: mpsc::unbounded_channel().0,
        });
        let peer = TcpPeer::make(
            Handle::current(),
            Arc::downgrade(&handler),
            Arc::new(TcpProtocolHead::new(1024)),
            PeerOptions::default(),
        );
        let (local, _remote) = tokio::io::duplex(1024);
        peer.attach(local);
        let pool = Arc::new(PeerPool::new());
        pool.insert(peer.clone(), None);
        let monitor = LivenessMonitor::new(pool, config(3), None);

        monitor.tick();
        monitor.tick();
        assert_eq!(peer.tcp_state().idle_ticks(), 1);
        peer.set_peer_live(true);
        peer.set_peer_active(true);
        let report = monitor.tick();
        assert_eq!(report, TickReport { checked: 1, probed: 0, closed: 0 });
        assert_eq!(peer.tcp_state().idle_ticks(), 0);
        peer.close();
    }

    #[tokio::test]
    async fn test_connecting_peer_is_skipped() {
        let pool = Arc::new(PeerPool::new());
        let handler: Weak<dyn TcpPeerHandler> = Weak::<CloseRecorder>::new();
        let peer = TcpPeer::make(
            Handle::current(),
            handler,
            Arc::new(TcpProtocolHead::new(1024)),
            PeerOptions::default(),
        );
        pool.insert(peer, None);
        let monitor = LivenessMonitor::new(pool, config(1), None);
        assert_eq!(monitor.tick().checked, 0);
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let monitor = LivenessMonitor::new(Arc::new(PeerPool::new()), config(1), None);
        let handle = monitor.start(notify_shutdown.clone(), shutdown_complete_tx);
        notify_shutdown.send(()).unwrap();
        handle.await.unwrap();
        assert!(shutdown_complete_rx.recv().await.is_none());
    }
}
