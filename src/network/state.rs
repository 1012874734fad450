use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Connecting = 0,
    Connected = 1,
    WebSocketHandshake = 2,
    Ready = 3,
    Closing = 4,
    Closed = 5,
}

impl PeerState {
    fn from_u8(value: u8) -> PeerState {
        match value {
            0 => PeerState::Connecting,
            1 => PeerState::Connected,
            2 => PeerState::WebSocketHandshake,
            3 => PeerState::Ready,
            4 => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::WebSocketHandshake => "websocket_handshake",
            PeerState::Ready => "ready",
            PeerState::Closing => "closing",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection state plus the liveness flags read by the heartbeat ticker.
///
/// The receive task is the only writer of `state` before closing starts,
/// the atomics exist so that the ticker and the pool can read it from
/// other threads.
#[derive(Debug)]
pub struct TcpState {
    state: AtomicU8,
    websocket: AtomicBool,
    live: AtomicBool,
    active: AtomicBool,
    idle_ticks: AtomicU32,
}

impl Default for TcpState {
    fn default() -> Self {
        TcpState {
            state: AtomicU8::new(PeerState::Connecting as u8),
            websocket: AtomicBool::new(false),
            live: AtomicBool::new(false),
            active: AtomicBool::new(false),
            idle_ticks: AtomicU32::new(0),
        }
    }
}

impl TcpState {
    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves `from` to `to` unless another transition got there first.
    pub(crate) fn transition(&self, from: PeerState, to: PeerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves forward to `closing` and returns the state it left, or `None`
    /// if closing already began.
    pub(crate) fn begin_closing(&self) -> Option<PeerState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < PeerState::Closing as u8).then_some(PeerState::Closing as u8)
            })
            .ok()
            .map(PeerState::from_u8)
    }

    pub fn is_ready(&self) -> bool {
        self.get() == PeerState::Ready
    }

    pub fn is_closing_or_closed(&self) -> bool {
        self.get() >= PeerState::Closing
    }

    pub fn websocket(&self) -> bool {
        self.websocket.load(Ordering::Acquire)
    }

    pub(crate) fn set_websocket(&self) {
        self.websocket.store(true, Ordering::Release);
    }

    pub fn peer_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_peer_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn peer_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_peer_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks.load(Ordering::Acquire)
    }

    pub(crate) fn add_idle_tick(&self) -> u32 {
        self.idle_ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_idle_ticks(&self) {
        self.idle_ticks.store(0, Ordering::Release);
    }
}
