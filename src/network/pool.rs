use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tracing::trace;

use super::TcpPeer;

struct PoolEntry {
    peer: TcpPeer,
    // returned to the server's connection limit when the peer leaves
    _permit: Option<OwnedSemaphorePermit>,
}

/// Live peers by id. Shared between the accept loop, handlers and the
/// liveness monitor, so it is a concurrent map rather than per-peer state.
#[derive(Default)]
pub struct PeerPool {
    peers: DashMap<u64, PoolEntry>,
    emptied: Notify,
    closing: AtomicBool,
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("peers", &self.peers.len())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl PeerPool {
    pub fn new() -> Self {
        PeerPool::default()
    }

    pub fn insert(&self, peer: TcpPeer, permit: Option<OwnedSemaphorePermit>) {
        trace!("pool add peer {}", peer.id());
        self.peers.insert(
            peer.id(),
            PoolEntry {
                peer,
                _permit: permit,
            },
        );
    }

    pub fn remove(&self, id: u64) -> Option<TcpPeer> {
        let removed = self.peers.remove(&id).map(|(_, entry)| entry.peer);
        if removed.is_some() {
            trace!("pool remove peer {}", id);
            if self.peers.is_empty() {
                self.emptied.notify_waiters();
            }
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<TcpPeer> {
        self.peers.get(&id).map(|entry| entry.peer.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Handles to every pooled peer. Taken as a snapshot so callers can
    /// close peers without holding a map shard lock.
    pub fn snapshot(&self) -> Vec<TcpPeer> {
        self.peers.iter().map(|entry| entry.peer.clone()).collect()
    }

    /// Closes every pooled peer gracefully. The pool stays marked as
    /// closing, so peers inserted afterwards can be closed by their owner.
    pub fn close_all(&self) {
        self.closing.store(true, Ordering::SeqCst);
        for peer in self.snapshot() {
            peer.close();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once the last peer has left the pool.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.peers.is_empty() {
                return;
            }
            emptied.await;
        }
    }
}
