//! Connection tasks. Each client episode is one task that exclusively
//! owns the socket (and TLS stream), negotiates the application protocol
//! and drives the session adapter. All accounting and admission decisions
//! stay in the worker loop; the task only reports events back.

use std::sync::Arc;
use std::time::Instant;

use rustls::pki_types::ServerName;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use surge_core::config::{Config, TargetAddr};

use crate::session::{self, SessionKind};

/// Commands from the worker to a connection task.
#[derive(Debug, Clone, Copy)]
pub enum ClientCmd {
    /// Issue the next request under stream id `id`.
    Submit { id: u64 },
    /// Orderly shutdown: stop submitting, let inflight streams finish.
    Terminate,
    /// Hard teardown.
    Stop,
}

#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub version: String,
    pub cipher: String,
    pub alpn: Option<String>,
}

/// Events a connection task reports to its worker.
#[derive(Debug)]
pub enum ClientEvent {
    Connected {
        addr_idx: Option<usize>,
        connect_done: Instant,
        max_streams: usize,
        proto: &'static str,
        tls: Option<TlsInfo>,
    },
    /// No address in the target list accepted the connection.
    ConnectFailed,
    /// TLS handshake or transfer setup failed.
    TlsFailed,
    /// ALPN negotiation did not yield a supported protocol.
    NegotiateFailed,
    /// Response head for stream `id`; doubles as the first-byte signal.
    RespHeader {
        id: u64,
        status: u16,
        head_bytes: u64,
        at: Instant,
    },
    /// RPC response status for stream `id` on the framed binary dialect.
    RpcStatus { id: u64, code: u16, at: Instant },
    StreamClosed {
        id: u64,
        success: bool,
        body_bytes: u64,
        total_bytes: u64,
        fin: bool,
    },
    /// The connection is gone. `reconnect_hint` is set when the session
    /// asked for a fresh connection (http/1.1 `Connection: close`).
    Disconnected { reconnect_hint: bool },
}

/// Everything a connection task needs, fixed at spawn time.
pub struct ClientCtx {
    pub idx: usize,
    pub config: Arc<Config>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub events: mpsc::Sender<(usize, ClientEvent)>,
    /// Address index to reuse on reconnect; `None` walks the list.
    pub current_addr: Option<usize>,
}

impl ClientCtx {
    pub async fn emit(&self, ev: ClientEvent) {
        let _ = self.events.send((self.idx, ev)).await;
    }
}

pub async fn run_client(ctx: ClientCtx, cmd_rx: mpsc::Receiver<ClientCmd>) {
    match &ctx.config.addr {
        TargetAddr::Tcp(addrs) => connect_tcp(&ctx, addrs, cmd_rx).await,
        TargetAddr::Unix(path) => {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    let kind = SessionKind::from_proto(ctx.config.no_tls_proto);
                    session::drive_session(kind, stream, &ctx, cmd_rx, None, Instant::now(), None)
                        .await;
                }
                Err(err) => {
                    debug!(client = ctx.idx, %err, "unix connect failed");
                    ctx.emit(ClientEvent::ConnectFailed).await;
                }
            }
        }
    }
}

async fn connect_tcp(
    ctx: &ClientCtx,
    addrs: &[std::net::SocketAddr],
    cmd_rx: mpsc::Receiver<ClientCmd>,
) {
    // Reuse the address that worked last episode, otherwise walk the
    // resolved list until one accepts. Failing over here does not consume
    // a request.
    let candidates: Vec<usize> = match ctx.current_addr {
        Some(i) => vec![i],
        None => (0..addrs.len()).collect(),
    };

    let mut picked = None;
    for i in candidates {
        match TcpStream::connect(addrs[i]).await {
            Ok(stream) => {
                picked = Some((i, stream));
                break;
            }
            Err(err) => debug!(client = ctx.idx, addr = %addrs[i], %err, "connect failed"),
        }
    }
    let Some((addr_idx, stream)) = picked else {
        ctx.emit(ClientEvent::ConnectFailed).await;
        return;
    };
    stream.set_nodelay(true).ok();

    if !ctx.config.is_tls() {
        let kind = SessionKind::from_proto(ctx.config.no_tls_proto);
        session::drive_session(
            kind,
            stream,
            ctx,
            cmd_rx,
            Some(addr_idx),
            Instant::now(),
            None,
        )
        .await;
        return;
    }

    let Some(tls_config) = ctx.tls.clone() else {
        ctx.emit(ClientEvent::TlsFailed).await;
        return;
    };
    let connector = TlsConnector::from(tls_config);
    let server_name = match ServerName::try_from(ctx.config.host.clone()) {
        Ok(name) => name,
        Err(err) => {
            warn!(client = ctx.idx, %err, "invalid TLS server name");
            ctx.emit(ClientEvent::TlsFailed).await;
            return;
        }
    };

    let tls_stream = match connector.connect(server_name, stream).await {
        Ok(s) => s,
        Err(err) => {
            warn!(client = ctx.idx, %err, "TLS handshake failed");
            ctx.emit(ClientEvent::TlsFailed).await;
            return;
        }
    };
    let connect_done = Instant::now();

    let (info, kind) = {
        let (_, conn) = tls_stream.get_ref();
        let alpn = conn.alpn_protocol().map(|p| p.to_vec());
        let info = TlsInfo {
            version: conn
                .protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_else(|| "unknown".to_string()),
            cipher: conn
                .negotiated_cipher_suite()
                .map(|c| format!("{:?}", c.suite()))
                .unwrap_or_else(|| "unknown".to_string()),
            alpn: alpn
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        };

        let kind = match alpn.as_deref() {
            Some(proto) => SessionKind::from_alpn(proto),
            // No ALPN from the peer: fall back to http/1.1 when it is in
            // the configured list.
            None if ctx.config.npn_list.iter().any(|p| p == "http/1.1") => {
                Some(SessionKind::PipelinedText)
            }
            None => None,
        };
        (info, kind)
    };

    let Some(kind) = kind else {
        ctx.emit(ClientEvent::NegotiateFailed).await;
        return;
    };

    session::drive_session(
        kind,
        tls_stream,
        ctx,
        cmd_rx,
        Some(addr_idx),
        connect_done,
        Some(info),
    )
    .await;
}
