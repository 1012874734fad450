use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use tcpeer::dispatch::{DispatchHandler, DispatchRegistry};
use tcpeer::network::{TcpPeer, TcpPeerHandler};
use tcpeer::protocol::{Message, MessageCategory, Protocol};
use tcpeer::service::{
    setup_tracing, HeadKind, HeartbeatProbe, ProtocolHeartbeat, ServerApp, TcpeerConfig,
};
use tcpeer::AppResult;
use tracing::{debug, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Echoes every frame as is; used with bare length-prefix heads.
struct RawEcho;

impl TcpPeerHandler for RawEcho {
    fn on_connect(&self, peer: &TcpPeer) {
        info!("peer {} connected from {:?}", peer.id(), peer.peer_addr());
    }

    fn on_read(&self, peer: &TcpPeer, frame: &Bytes) -> AppResult<()> {
        peer.async_send(frame.clone())
    }
}

fn echo_handler(protocol: Arc<dyn Protocol>) -> DispatchHandler {
    let mut registry = DispatchRegistry::new();
    registry.set_default(|ctx| {
        debug!(
            "echo type {} from peer {}, {} bytes",
            ctx.meta().message_type,
            ctx.peer().id(),
            ctx.payload().len()
        );
        match ctx.meta().category {
            MessageCategory::Request => {
                ctx.resp_bytes(ctx.meta().message_type, ctx.payload().clone(), true)
            }
            _ => ctx.send(&Message::new(*ctx.meta(), ctx.payload().clone())),
        }
    });
    DispatchHandler::new(protocol, registry)
        .with_connect_hook(|peer| info!("peer {} connected from {:?}", peer.id(), peer.peer_addr()))
        .with_close_hook(|peer, error| match error {
            Some(err) => info!("peer {} closed: {}", peer.id(), err),
            None => info!("peer {} closed", peer.id()),
        })
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let log_dir = std::env::var("TCPEER_LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    let _guard = setup_tracing(log_dir, commandline.verbose)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = TcpeerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let (handler, probe): (Arc<dyn TcpPeerHandler>, Option<Arc<dyn HeartbeatProbe>>) =
        match config.protocol.head {
            HeadKind::Tcp => {
                let protocol: Arc<dyn Protocol> = Arc::new(config.protocol.build_protocol());
                let probe: Arc<dyn HeartbeatProbe> =
                    Arc::new(ProtocolHeartbeat::new(protocol.clone()));
                (Arc::new(echo_handler(protocol)), Some(probe))
            }
            HeadKind::Length => (Arc::new(RawEcho), None),
        };

    info!("tcpeer echo service starting on {}", config.listen_address());
    ServerApp::new(config).start(handler, probe)
}
