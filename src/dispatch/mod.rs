//! Message routing on top of the peer runtime.
//!
//! `DispatchHandler` is a ready-made `TcpPeerHandler`: it decodes each
//! frame with a `Protocol`, answers heartbeat probes, hands responses to
//! the `RequestCorrelator` and routes everything else through the
//! `DispatchRegistry`.

pub use correlator::{RequestCorrelator, ResponseStream};
pub use handler::DispatchHandler;
pub use registry::{Context, DispatchRegistry, MessageHandler};

mod correlator;
mod handler;
mod registry;
