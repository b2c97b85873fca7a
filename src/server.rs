use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{ListenerEndpoint, ServerConfig};
use crate::events::EventPipeline;
use crate::session::{self, SessionContext};
use crate::tftp_protocol::{MAX_REQUEST, OPCODE_RRQ, Packet};

/// Bind every configured endpoint, then run one listener per endpoint
/// until the process dies. Any bind failure aborts startup before a
/// single listener task is spawned.
pub async fn run(cfg: Arc<ServerConfig>, events: EventPipeline) -> Result<()> {
    let mut sockets = Vec::with_capacity(cfg.listeners.len());
    for ep in &cfg.listeners {
        let sock = bind_listener(ep)
            .with_context(|| format!("failed to bind listener {}:{}", ep.addr, ep.port))?;
        info!("listening on {}:{}", ep.addr, ep.port);
        sockets.push((*ep, sock));
    }

    let mut listeners = JoinSet::new();
    for (ep, sock) in sockets {
        listeners.spawn(listener_loop(ep, sock, Arc::clone(&cfg), events.clone()));
    }
    while listeners.join_next().await.is_some() {}
    Ok(())
}

/// Create the listener socket with `SO_REUSEADDR` set before binding.
pub fn bind_listener(ep: &ListenerEndpoint) -> Result<UdpSocket> {
    let raw = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    raw.set_reuse_address(true)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(ep.addr, ep.port));
    raw.bind(&addr.into())?;
    raw.set_nonblocking(true)?;

    let std_sock: std::net::UdpSocket = raw.into();
    Ok(UdpSocket::from_std(std_sock)?)
}

/// Demultiplex fresh requests on one endpoint. Every well-formed RRQ is
/// handed to a detached session task; the listener itself never waits on
/// transfer work.
pub async fn listener_loop(
    ep: ListenerEndpoint,
    sock: UdpSocket,
    cfg: Arc<ServerConfig>,
    events: EventPipeline,
) {
    let mut buf = [0u8; MAX_REQUEST];
    loop {
        let (n, peer) = match sock.recv_from(&mut buf).await {
            Ok(recv) => recv,
            Err(e) => {
                error!("recvfrom error on {}:{}: {e}", ep.addr, ep.port);
                continue;
            }
        };
        if n < 2 {
            continue;
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        if opcode != OPCODE_RRQ {
            debug!("ignoring non-RRQ opcode={opcode} from {peer}");
            continue;
        }

        let (filename, mode) = match Packet::from_bytes(&buf[..n]) {
            Ok(Packet::RRQ { filename, mode }) => (filename, mode),
            Ok(other) => {
                debug!("ignoring unexpected packet on listener: {other:?}");
                continue;
            }
            Err(e) => {
                error!("failed to parse RRQ from {peer}: {e}");
                continue;
            }
        };

        let SocketAddr::V4(client) = peer else {
            debug!("ignoring RRQ from non-IPv4 source {peer}");
            continue;
        };

        // Mode is logged but not acted on: netascii and octet are both
        // served as raw bytes.
        info!("RRQ from {client} file={filename:?} mode={mode:?}");

        let ctx = SessionContext {
            bind_addr: ep.addr,
            client,
            filename,
        };
        tokio::spawn(session::run(ctx, Arc::clone(&cfg), events.clone()));
    }
}
