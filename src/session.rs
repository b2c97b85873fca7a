use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Duration, timeout};
use tracing::{debug, error};

use crate::config::ServerConfig;
use crate::events::{Event, EventKind, EventPipeline, now_iso8601};
use crate::tftp_protocol::{
    BLOCK_SIZE, ERR_FILE_NOT_FOUND, ERR_NOT_DEFINED, OPCODE_DATA, Packet,
};

/// Everything a session owns about one read request. Handed off from the
/// listener; dropped when the session terminates.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Address the accepting listener is bound to; the session socket
    /// binds here with an ephemeral port.
    pub bind_addr: Ipv4Addr,
    /// The client's transport ID.
    pub client: SocketAddrV4,
    /// Filename exactly as it appeared in the RRQ.
    pub filename: String,
}

/// Strip all leading `/` characters and reject anything containing `..`.
///
/// A conservative filter rather than a canonicalizer: symlinks inside the
/// root are followed and trusted, and names like `foo..bar` are refused.
/// An empty result is allowed through; the subsequent open fails.
pub fn sanitize_filename(requested: &str) -> Option<String> {
    let stripped = requested.trim_start_matches('/');
    if stripped.contains("..") {
        return None;
    }
    Some(stripped.to_string())
}

struct TransferFailure {
    tag: &'static str,
    bytes: u64,
}

impl TransferFailure {
    fn new(tag: &'static str) -> Self {
        Self { tag, bytes: 0 }
    }
}

/// Serve one RRQ to completion. Emits the START event on entry, exactly
/// one terminal event on exit, and appends the per-request audit line for
/// every outcome except an unsafe filename.
pub async fn run(ctx: SessionContext, cfg: Arc<ServerConfig>, events: EventPipeline) {
    let start_ts = now_iso8601();
    events.emit(&lifecycle_event(
        &ctx,
        EventKind::Start,
        0,
        "start",
        "rrq_received",
        &start_ts,
        String::new(),
    ));

    let Some(safe_name) = sanitize_filename(&ctx.filename) else {
        error!(
            "rejected unsafe filename {:?} from {}",
            ctx.filename, ctx.client
        );
        events.emit(&lifecycle_event(
            &ctx,
            EventKind::Error,
            0,
            "error",
            "unsafe_filename",
            &start_ts,
            now_iso8601(),
        ));
        return;
    };

    let result = transfer(&ctx, &cfg, &safe_name).await;
    let end_ts = now_iso8601();
    let ev = match result {
        Ok(bytes) => lifecycle_event(
            &ctx,
            EventKind::Done,
            bytes,
            "ok",
            "transfer_complete",
            &start_ts,
            end_ts,
        ),
        Err(fail) => lifecycle_event(
            &ctx,
            EventKind::Error,
            fail.bytes,
            "error",
            fail.tag,
            &start_ts,
            end_ts,
        ),
    };
    events.emit(&ev);
    append_audit_line(&cfg.root_dir, &safe_name, &ev).await;
}

/// The stop-and-wait transfer itself: open the file, then alternate
/// DATA(n) / ACK(n) until a short block completes the file or a failure
/// ends the session. Returns the total payload bytes acknowledged.
async fn transfer(
    ctx: &SessionContext,
    cfg: &ServerConfig,
    safe_name: &str,
) -> Result<u64, TransferFailure> {
    let path = cfg.root_dir.join(safe_name);
    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open {}: {e}", path.display());
            send_not_found(ctx.client).await;
            return Err(TransferFailure::new("file_not_found"));
        }
    };

    let sock = bind_session_socket(ctx.bind_addr)?;
    let client = SocketAddr::V4(ctx.client);
    let ack_wait = Duration::from_secs(cfg.timeout_sec);

    let mut block: u16 = 1;
    let mut total: u64 = 0;
    let mut data_buf = [0u8; 4 + BLOCK_SIZE];
    let mut ack_buf = [0u8; 4 + BLOCK_SIZE];

    loop {
        let n = match file.read(&mut data_buf[4..]).await {
            Ok(n) => n,
            Err(e) => {
                error!("read error on {}: {e}", path.display());
                let pkt = Packet::ERROR {
                    code: ERR_NOT_DEFINED,
                    msg: "Read error".into(),
                };
                let _ = sock.send_to(&pkt.to_bytes(), client).await;
                return Err(TransferFailure {
                    tag: "read_error",
                    bytes: total,
                });
            }
        };

        data_buf[0..2].copy_from_slice(&OPCODE_DATA.to_be_bytes());
        data_buf[2..4].copy_from_slice(&block.to_be_bytes());
        let pkt = &data_buf[..4 + n];

        let mut retries: u32 = 0;
        'send: loop {
            if let Err(e) = sock.send_to(pkt, client).await {
                error!("sendto {} failed: {e}", ctx.client);
                return Err(TransferFailure {
                    tag: "transfer_failed",
                    bytes: total,
                });
            }

            loop {
                match timeout(ack_wait, sock.recv_from(&mut ack_buf)).await {
                    Err(_) => {
                        retries += 1;
                        if retries > cfg.max_retries {
                            error!("max retries exceeded for block {block} to {}", ctx.client);
                            return Err(TransferFailure {
                                tag: "transfer_failed",
                                bytes: total,
                            });
                        }
                        debug!("timeout waiting for ACK({block}), retransmitting");
                        continue 'send;
                    }
                    Ok(Err(e)) => {
                        error!("recv error on session socket: {e}");
                        return Err(TransferFailure {
                            tag: "transfer_failed",
                            bytes: total,
                        });
                    }
                    Ok(Ok((m, from))) => {
                        if from != client {
                            // RFC 1350 §4: only the TID this session was
                            // created for may drive it.
                            debug!("ignoring datagram from unexpected source {from}");
                            continue;
                        }
                        match Packet::from_bytes(&ack_buf[..m]) {
                            Ok(Packet::ACK { block_num }) if block_num == block => break 'send,
                            Ok(other) => {
                                debug!(
                                    "unexpected packet {other:?}, retransmitting block {block}"
                                );
                                continue 'send;
                            }
                            Err(e) => {
                                debug!(
                                    "malformed packet from {from}: {e}, retransmitting block {block}"
                                );
                                continue 'send;
                            }
                        }
                    }
                }
            }
        }

        total += n as u64;
        if n < BLOCK_SIZE {
            return Ok(total);
        }
        block = block.wrapping_add(1);
        if block == 0 {
            // Block 0 never appears in DATA; wrap re-enters at 1.
            block = 1;
        }
    }
}

/// Fresh UDP socket for one session: the listener's address, an ephemeral
/// port.
fn bind_session_socket(bind_addr: Ipv4Addr) -> Result<UdpSocket, TransferFailure> {
    let raw = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(|e| {
        error!("failed to create session socket: {e}");
        TransferFailure::new("socket_failed")
    })?;

    let local = SocketAddr::V4(SocketAddrV4::new(bind_addr, 0));
    raw.bind(&local.into()).map_err(|e| {
        error!("failed to bind session socket on {bind_addr}: {e}");
        TransferFailure::new("bind_failed")
    })?;
    raw.set_nonblocking(true).map_err(|e| {
        error!("failed to configure session socket: {e}");
        TransferFailure::new("socket_failed")
    })?;

    let std_sock: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_sock).map_err(|e| {
        error!("failed to register session socket: {e}");
        TransferFailure::new("socket_failed")
    })
}

/// Tell the client the file does not exist, from a transient socket. The
/// session never had a socket of its own on this path.
async fn send_not_found(client: SocketAddrV4) {
    let Ok(sock) = UdpSocket::bind("0.0.0.0:0").await else {
        return;
    };
    let pkt = Packet::ERROR {
        code: ERR_FILE_NOT_FOUND,
        msg: "File not found".into(),
    };
    let _ = sock.send_to(&pkt.to_bytes(), SocketAddr::V4(client)).await;
}

/// Append the one-line transfer record to `<root_dir>/<safe_name>.log`.
/// The audit file lives in the served root, next to the file itself.
async fn append_audit_line(root_dir: &Path, safe_name: &str, ev: &Event) {
    let path = root_dir.join(format!("{safe_name}.log"));
    let line = format!(
        "{};{};{};{};{};{};{}\n",
        ev.start, ev.end, ev.client_ip, ev.client_port, ev.bytes, ev.status, ev.message
    );

    let mut file = match OpenOptions::new().append(true).create(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open request log {}: {e}", path.display());
            return;
        }
    };
    if let Err(e) = file.write_all(line.as_bytes()).await {
        error!("failed to write request log {}: {e}", path.display());
    }
    if let Err(e) = file.flush().await {
        error!("failed to flush request log {}: {e}", path.display());
    }
}

fn lifecycle_event(
    ctx: &SessionContext,
    kind: EventKind,
    bytes: u64,
    status: &str,
    message: &str,
    start: &str,
    end: String,
) -> Event {
    Event {
        kind,
        client_ip: ctx.client.ip().to_string(),
        client_port: ctx.client.port(),
        filename: ctx.filename.clone(),
        bytes,
        status: status.to_string(),
        message: message.to_string(),
        start: start.to_string(),
        end,
    }
}
