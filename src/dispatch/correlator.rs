use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::Message;
use crate::{AppError, AppResult};

type ResponseSender = mpsc::UnboundedSender<AppResult<Message>>;

/// Matches responses to outstanding requests by peer and request id.
///
/// Every response part is delivered to the request's [`ResponseStream`];
/// the part flagged `last` retires the entry. When a connection closes,
/// every request pending on that peer fails with `PeerClosed`.
#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: AtomicU32,
    pending: DashMap<(u64, u32), ResponseSender>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        RequestCorrelator {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        RequestCorrelator::default()
    }

    /// Allocates a request id (never 0) on `peer_id` and the stream its
    /// responses arrive on.
    pub fn register(&self, peer_id: u64) -> (u32, ResponseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let dashmap::Entry::Vacant(entry) = self.pending.entry((peer_id, id)) {
                entry.insert(tx);
                trace!("peer {} request {} registered", peer_id, id);
                return (
                    id,
                    ResponseStream {
                        request_id: id,
                        rx,
                        done: false,
                    },
                );
            }
        }
    }

    /// Routes a response read from `peer_id` to its request. Hands the
    /// message back when no request on that peer is waiting for it.
    pub fn complete(&self, peer_id: u64, message: Message) -> Option<Message> {
        let id = message.meta.request_id;
        let key = (peer_id, id);
        let sender = if message.meta.last {
            self.pending.remove(&key).map(|(_, tx)| tx)
        } else {
            self.pending.get(&key).map(|tx| tx.clone())
        };
        match sender {
            Some(tx) => {
                if tx.send(Ok(message)).is_err() {
                    debug!("request {} response dropped, receiver gone", id);
                }
                None
            }
            None => Some(message),
        }
    }

    pub fn cancel(&self, peer_id: u64, request_id: u32) -> bool {
        self.pending.remove(&(peer_id, request_id)).is_some()
    }

    /// Fails every request pending on `peer_id`; other peers are untouched.
    pub fn fail_peer(&self, peer_id: u64, reason: &str) {
        let keys: Vec<(u64, u32)> = self
            .pending
            .iter()
            .map(|entry| *entry.key())
            .filter(|(peer, _)| *peer == peer_id)
            .collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(AppError::PeerClosed(reason.to_string())));
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_on(&self, peer_id: u64) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.key().0 == peer_id)
            .count()
    }
}

/// Response parts of one request, ending with the part flagged `last`.
#[derive(Debug)]
pub struct ResponseStream {
    request_id: u32,
    rx: mpsc::UnboundedReceiver<AppResult<Message>>,
    done: bool,
}

impl ResponseStream {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Next response part; `None` once the last part or an error was seen.
    pub async fn next(&mut self) -> Option<AppResult<Message>> {
        if self.done {
            return None;
        }
        let item = match self.rx.recv().await {
            Some(item) => item,
            None => Err(AppError::PeerClosed(format!(
                "request {} abandoned before its last response",
                self.request_id
            ))),
        };
        match &item {
            Ok(message) if !message.meta.last => {}
            _ => self.done = true,
        }
        Some(item)
    }

    /// Waits for every part up to and including the last one.
    pub async fn collect(mut self) -> AppResult<Vec<Message>> {
        let mut parts = Vec::new();
        while let Some(item) = self.next().await {
            parts.push(item?);
        }
        Ok(parts)
    }
}
