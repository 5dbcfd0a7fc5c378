//! Session adapters: three interchangeable protocol engines behind one
//! contract. The multiplexed and pipelined-text variants delegate framing
//! to hyper's connection handles; the framed binary variant speaks the
//! bolt wire format directly.

use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{header, Method, Request, Response, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use surge_core::bolt;
use surge_core::config::{Config, Proto};

use crate::client::{ClientCmd, ClientCtx, ClientEvent, TlsInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Multiplexed,
    PipelinedText,
    FramedBinary,
}

impl SessionKind {
    pub fn from_proto(proto: Proto) -> Self {
        match proto {
            Proto::Http2 => SessionKind::Multiplexed,
            Proto::Http11 => SessionKind::PipelinedText,
            Proto::SofaRpc => SessionKind::FramedBinary,
        }
    }

    pub fn from_alpn(proto: &[u8]) -> Option<Self> {
        match proto {
            b"h2" | b"h2-16" | b"h2-14" => Some(SessionKind::Multiplexed),
            b"http/1.1" => Some(SessionKind::PipelinedText),
            b"sofarpc" => Some(SessionKind::FramedBinary),
            _ => None,
        }
    }

    pub fn ident(self) -> &'static str {
        match self {
            SessionKind::Multiplexed => "h2",
            SessionKind::PipelinedText => "http/1.1",
            SessionKind::FramedBinary => "sofarpc",
        }
    }

    /// Pipeline depth used to seed the initial submissions after connect:
    /// strict pipelining for the text protocol, the configured stream
    /// limit for the multiplexed and framed variants.
    pub fn max_concurrent_streams(self, config: &Config) -> usize {
        match self {
            SessionKind::PipelinedText => 1,
            _ => config.max_concurrent_streams,
        }
    }
}

enum LoopExit {
    /// Orderly shutdown; let inflight streams finish.
    Graceful,
    /// Hard teardown.
    Hard,
    /// The session wants a fresh connection.
    Reconnect,
    /// The transport died underneath us.
    DriverDead,
}

pub async fn drive_session<T>(
    kind: SessionKind,
    io: T,
    ctx: &ClientCtx,
    cmd_rx: mpsc::Receiver<ClientCmd>,
    addr_idx: Option<usize>,
    connect_done: Instant,
    tls_info: Option<TlsInfo>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match kind {
        SessionKind::Multiplexed => {
            drive_multiplexed(io, ctx, cmd_rx, addr_idx, connect_done, tls_info).await
        }
        SessionKind::PipelinedText => {
            drive_pipelined(io, ctx, cmd_rx, addr_idx, connect_done, tls_info).await
        }
        SessionKind::FramedBinary => {
            drive_framed(io, ctx, cmd_rx, addr_idx, connect_done, tls_info).await
        }
    }
}

/// Pre-built request parts, one per configured request line. Cloned per
/// submission with the body attached.
pub fn build_templates(config: &Config, absolute_form: bool) -> Result<Vec<http::request::Parts>> {
    let find = |name: &str| {
        config
            .shared_headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    let method: Method = find(":method")
        .unwrap_or("GET")
        .parse()
        .context("invalid request method")?;
    let scheme = find(":scheme").unwrap_or(config.scheme.as_str());
    let authority_raw = find(":authority").unwrap_or(config.host.as_str());
    // Filesystem-socket targets have no usable authority.
    let authority = if authority_raw.contains('/') {
        "localhost"
    } else {
        authority_raw
    };

    let mut templates = Vec::with_capacity(config.reqlines.len());
    for reqline in &config.reqlines {
        let uri: Uri = if absolute_form {
            format!("{scheme}://{authority}{reqline}")
                .parse()
                .with_context(|| format!("invalid request URI for {reqline}"))?
        } else {
            reqline
                .parse()
                .with_context(|| format!("invalid request line {reqline}"))?
        };

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        if !absolute_form {
            builder = builder.header(header::HOST, authority);
        }
        for (name, value) in &config.shared_headers {
            if name.starts_with(':') {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let (parts, ()) = builder
            .body(())
            .context("could not assemble request")?
            .into_parts();
        templates.push(parts);
    }
    Ok(templates)
}

fn make_request(
    templates: &[http::request::Parts],
    reqidx: &mut usize,
    data: &Option<Bytes>,
) -> Request<Full<Bytes>> {
    let parts = templates[*reqidx % templates.len()].clone();
    *reqidx += 1;
    let body = data.clone().unwrap_or_else(Bytes::new);
    Request::from_parts(parts, Full::new(body))
}

/// Rough wire size of a response head: status line plus `name: value`
/// and line terminators per header.
fn head_size<B>(resp: &Response<B>) -> u64 {
    let mut n = 17u64;
    for (name, value) in resp.headers() {
        n += name.as_str().len() as u64 + value.as_bytes().len() as u64 + 4;
    }
    n
}

fn closes_connection<B>(resp: &Response<B>) -> bool {
    let close_hdr = resp.headers().get_all(header::CONNECTION).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    });
    close_hdr || resp.version() == Version::HTTP_10
}

async fn drive_multiplexed<T>(
    io: T,
    ctx: &ClientCtx,
    mut cmd_rx: mpsc::Receiver<ClientCmd>,
    addr_idx: Option<usize>,
    connect_done: Instant,
    tls_info: Option<TlsInfo>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let templates = match build_templates(&ctx.config, true) {
        Ok(t) => t,
        Err(err) => {
            warn!(client = ctx.idx, %err, "could not build request templates");
            ctx.emit(ClientEvent::ConnectFailed).await;
            return;
        }
    };

    let (send, conn) = match http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await {
        Ok(v) => v,
        Err(err) => {
            warn!(client = ctx.idx, %err, "h2 handshake failed");
            ctx.emit(ClientEvent::ConnectFailed).await;
            return;
        }
    };
    let mut driver = tokio::spawn(conn);

    ctx.emit(ClientEvent::Connected {
        addr_idx,
        connect_done,
        max_streams: SessionKind::Multiplexed.max_concurrent_streams(&ctx.config),
        proto: SessionKind::Multiplexed.ident(),
        tls: tls_info,
    })
    .await;

    let mut reqidx = 0usize;
    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Submit { id }) => {
                    let req = make_request(&templates, &mut reqidx, &ctx.config.data);
                    let mut sender = send.clone();
                    let events = ctx.events.clone();
                    let idx = ctx.idx;
                    tokio::spawn(async move {
                        drive_stream(&mut sender, req, id, idx, &events).await;
                    });
                }
                Some(ClientCmd::Terminate) => break LoopExit::Graceful,
                Some(ClientCmd::Stop) | None => break LoopExit::Hard,
            },
            result = &mut driver => {
                if let Ok(Err(err)) = result {
                    debug!(client = ctx.idx, %err, "h2 connection terminated");
                }
                break LoopExit::DriverDead;
            }
        }
    };

    match exit {
        LoopExit::Graceful => {
            // Dropping our handle starts the GOAWAY path; streams already
            // submitted hold their own handles and run to completion.
            drop(send);
            let _ = driver.await;
        }
        LoopExit::Hard | LoopExit::Reconnect => driver.abort(),
        LoopExit::DriverDead => {}
    }
    ctx.emit(ClientEvent::Disconnected {
        reconnect_hint: false,
    })
    .await;
}

async fn drive_stream(
    sender: &mut http2::SendRequest<Full<Bytes>>,
    req: Request<Full<Bytes>>,
    id: u64,
    idx: usize,
    events: &mpsc::Sender<(usize, ClientEvent)>,
) {
    match sender.send_request(req).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let head_bytes = head_size(&resp);
            let _ = events
                .send((
                    idx,
                    ClientEvent::RespHeader {
                        id,
                        status,
                        head_bytes,
                        at: Instant::now(),
                    },
                ))
                .await;

            match resp.into_body().collect().await {
                Ok(collected) => {
                    let body_bytes = collected.to_bytes().len() as u64;
                    let _ = events
                        .send((
                            idx,
                            ClientEvent::StreamClosed {
                                id,
                                success: true,
                                body_bytes,
                                total_bytes: body_bytes,
                                fin: false,
                            },
                        ))
                        .await;
                }
                Err(err) => {
                    debug!(%err, "h2 body error");
                    let _ = events
                        .send((
                            idx,
                            ClientEvent::StreamClosed {
                                id,
                                success: false,
                                body_bytes: 0,
                                total_bytes: 0,
                                fin: false,
                            },
                        ))
                        .await;
                }
            }
        }
        Err(err) => {
            debug!(%err, "h2 request error");
            let _ = events
                .send((
                    idx,
                    ClientEvent::StreamClosed {
                        id,
                        success: false,
                        body_bytes: 0,
                        total_bytes: 0,
                        fin: false,
                    },
                ))
                .await;
        }
    }
}

async fn drive_pipelined<T>(
    io: T,
    ctx: &ClientCtx,
    mut cmd_rx: mpsc::Receiver<ClientCmd>,
    addr_idx: Option<usize>,
    connect_done: Instant,
    tls_info: Option<TlsInfo>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let templates = match build_templates(&ctx.config, false) {
        Ok(t) => t,
        Err(err) => {
            warn!(client = ctx.idx, %err, "could not build request templates");
            ctx.emit(ClientEvent::ConnectFailed).await;
            return;
        }
    };

    let (mut send, conn) = match http1::handshake(TokioIo::new(io)).await {
        Ok(v) => v,
        Err(err) => {
            warn!(client = ctx.idx, %err, "http/1.1 handshake failed");
            ctx.emit(ClientEvent::ConnectFailed).await;
            return;
        }
    };
    let mut driver = tokio::spawn(conn);

    if send.ready().await.is_err() {
        driver.abort();
        ctx.emit(ClientEvent::ConnectFailed).await;
        return;
    }

    ctx.emit(ClientEvent::Connected {
        addr_idx,
        connect_done,
        max_streams: SessionKind::PipelinedText.max_concurrent_streams(&ctx.config),
        proto: SessionKind::PipelinedText.ident(),
        tls: tls_info,
    })
    .await;

    let mut reqidx = 0usize;
    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Submit { id }) => {
                    let req = make_request(&templates, &mut reqidx, &ctx.config.data);
                    match send.send_request(req).await {
                        Ok(resp) => {
                            let status = resp.status().as_u16();
                            let head_bytes = head_size(&resp);
                            ctx.emit(ClientEvent::RespHeader {
                                id,
                                status,
                                head_bytes,
                                at: Instant::now(),
                            })
                            .await;

                            let fin = closes_connection(&resp);
                            match resp.into_body().collect().await {
                                Ok(collected) => {
                                    let body_bytes = collected.to_bytes().len() as u64;
                                    ctx.emit(ClientEvent::StreamClosed {
                                        id,
                                        success: true,
                                        body_bytes,
                                        total_bytes: body_bytes,
                                        fin,
                                    })
                                    .await;
                                }
                                Err(err) => {
                                    debug!(%err, "http/1.1 body error");
                                    ctx.emit(ClientEvent::StreamClosed {
                                        id,
                                        success: false,
                                        body_bytes: 0,
                                        total_bytes: 0,
                                        fin: true,
                                    })
                                    .await;
                                    break LoopExit::Reconnect;
                                }
                            }
                            if fin {
                                // The server is closing this connection;
                                // ask the worker for a new one.
                                break LoopExit::Reconnect;
                            }
                        }
                        Err(err) => {
                            debug!(client = ctx.idx, %err, "http/1.1 request error");
                            ctx.emit(ClientEvent::StreamClosed {
                                id,
                                success: false,
                                body_bytes: 0,
                                total_bytes: 0,
                                fin: true,
                            })
                            .await;
                            break LoopExit::Reconnect;
                        }
                    }
                }
                Some(ClientCmd::Terminate) => break LoopExit::Graceful,
                Some(ClientCmd::Stop) | None => break LoopExit::Hard,
            },
            _ = &mut driver => break LoopExit::DriverDead,
        }
    };

    let reconnect_hint = matches!(exit, LoopExit::Reconnect);
    match exit {
        LoopExit::Graceful => {
            drop(send);
            let _ = driver.await;
        }
        LoopExit::Hard | LoopExit::Reconnect => driver.abort(),
        LoopExit::DriverDead => {}
    }
    ctx.emit(ClientEvent::Disconnected { reconnect_hint }).await;
}

async fn drive_framed<T>(
    io: T,
    ctx: &ClientCtx,
    mut cmd_rx: mpsc::Receiver<ClientCmd>,
    addr_idx: Option<usize>,
    connect_done: Instant,
    tls_info: Option<TlsInfo>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (rd, mut wr) = tokio::io::split(io);
    let (pending_tx, pending_rx) = mpsc::unbounded_channel::<u64>();
    let mut reader = tokio::spawn(read_responses(
        rd,
        pending_rx,
        ctx.events.clone(),
        ctx.idx,
    ));

    ctx.emit(ClientEvent::Connected {
        addr_idx,
        connect_done,
        max_streams: SessionKind::FramedBinary.max_concurrent_streams(&ctx.config),
        proto: SessionKind::FramedBinary.ident(),
        tls: tls_info,
    })
    .await;

    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Submit { id }) => {
                    let frame = bolt::encode_request(&ctx.config.rpc, id as u32);
                    if wr.write_all(&frame).await.is_err() {
                        break LoopExit::DriverDead;
                    }
                    let _ = pending_tx.send(id);
                }
                Some(ClientCmd::Terminate) => break LoopExit::Graceful,
                Some(ClientCmd::Stop) | None => break LoopExit::Hard,
            },
            _ = &mut reader => break LoopExit::DriverDead,
        }
    };

    match exit {
        LoopExit::Graceful => {
            // Half-close the write side and let the reader drain the
            // response pipeline.
            drop(pending_tx);
            let _ = wr.shutdown().await;
            let _ = reader.await;
        }
        _ => reader.abort(),
    }
    ctx.emit(ClientEvent::Disconnected {
        reconnect_hint: false,
    })
    .await;
}

/// Responses arrive in request order on the framed binary dialect; match
/// them FIFO against the submitted ids.
async fn read_responses<T>(
    mut rd: ReadHalf<T>,
    mut pending: mpsc::UnboundedReceiver<u64>,
    events: mpsc::Sender<(usize, ClientEvent)>,
    idx: usize,
) where
    T: AsyncRead + Send + 'static,
{
    let mut head = [0u8; bolt::RESPONSE_HEADER_LEN];
    while let Some(id) = pending.recv().await {
        if rd.read_exact(&mut head).await.is_err() {
            return;
        }
        let decoded = match bolt::decode_response_head(&head) {
            Ok(h) => h,
            Err(err) => {
                debug!(client = idx, %err, "bolt frame error");
                return;
            }
        };

        let _ = events
            .send((
                idx,
                ClientEvent::RpcStatus {
                    id,
                    code: decoded.status,
                    at: Instant::now(),
                },
            ))
            .await;

        let body_len = decoded.body_len();
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            if rd.read_exact(&mut body).await.is_err() {
                return;
            }
        }

        let _ = events
            .send((
                idx,
                ClientEvent::StreamClosed {
                    id,
                    success: true,
                    body_bytes: decoded.content_len as u64,
                    total_bytes: body_len as u64,
                    fin: false,
                },
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use surge_core::bolt::BoltFixture;
    use surge_core::config::TargetAddr;
    use surge_core::request::{build_shared_headers, parse_base_uri};

    fn test_config() -> Config {
        let base = parse_base_uri("http://example.org:8080/").unwrap();
        let shared = build_shared_headers(&base, None, "surge/test", &[]);
        Config {
            scheme: base.scheme.clone(),
            host: base.host.clone(),
            port: base.port,
            default_port: base.default_port,
            addr: TargetAddr::Tcp(vec!["127.0.0.1:8080".parse().unwrap()]),
            nreqs: 1,
            nclients: 1,
            nthreads: 1,
            max_concurrent_streams: 7,
            rate: 0,
            rate_period: Duration::from_secs(1),
            duration: Duration::ZERO,
            warm_up_time: Duration::ZERO,
            conn_active_timeout: None,
            conn_inactivity_timeout: None,
            qps: 0,
            no_tls_proto: Proto::Http2,
            npn_list: vec!["h2".to_string()],
            reqlines: vec!["/a".to_string(), "/b".to_string()],
            shared_headers: shared,
            data: None,
            header_table_size: 4096,
            encoder_header_table_size: 4096,
            rpc: BoltFixture::default(),
            verbose: false,
        }
    }

    #[test]
    fn alpn_selection() {
        assert_eq!(SessionKind::from_alpn(b"h2"), Some(SessionKind::Multiplexed));
        assert_eq!(
            SessionKind::from_alpn(b"h2-14"),
            Some(SessionKind::Multiplexed)
        );
        assert_eq!(
            SessionKind::from_alpn(b"http/1.1"),
            Some(SessionKind::PipelinedText)
        );
        assert_eq!(
            SessionKind::from_alpn(b"sofarpc"),
            Some(SessionKind::FramedBinary)
        );
        assert_eq!(SessionKind::from_alpn(b"spdy/3"), None);
    }

    #[test]
    fn pipeline_depth_per_kind() {
        let config = test_config();
        assert_eq!(SessionKind::Multiplexed.max_concurrent_streams(&config), 7);
        assert_eq!(SessionKind::PipelinedText.max_concurrent_streams(&config), 1);
        assert_eq!(SessionKind::FramedBinary.max_concurrent_streams(&config), 7);
    }

    #[test]
    fn absolute_form_templates_carry_authority() {
        let config = test_config();
        let templates = build_templates(&config, true).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(
            templates[0].uri.to_string(),
            "http://example.org:8080/a"
        );
        assert!(templates[0].headers.get(header::HOST).is_none());
        assert!(templates[0].headers.get(header::USER_AGENT).is_some());
    }

    #[test]
    fn origin_form_templates_carry_host_header() {
        let config = test_config();
        let templates = build_templates(&config, false).unwrap();
        assert_eq!(templates[1].uri.to_string(), "/b");
        assert_eq!(
            templates[1].headers.get(header::HOST).unwrap(),
            "example.org:8080"
        );
    }

    #[test]
    fn templates_cycle_request_lines() {
        let config = test_config();
        let templates = build_templates(&config, false).unwrap();
        let mut reqidx = 0usize;
        let r1 = make_request(&templates, &mut reqidx, &None);
        let r2 = make_request(&templates, &mut reqidx, &None);
        let r3 = make_request(&templates, &mut reqidx, &None);
        assert_eq!(r1.uri().path(), "/a");
        assert_eq!(r2.uri().path(), "/b");
        assert_eq!(r3.uri().path(), "/a");
    }

    #[test]
    fn post_body_flows_from_config() {
        let mut config = test_config();
        config.data = Some(Bytes::from_static(b"payload"));
        let base = parse_base_uri("http://example.org:8080/").unwrap();
        config.shared_headers = build_shared_headers(&base, Some(7), "surge/test", &[]);
        let templates = build_templates(&config, false).unwrap();
        assert_eq!(templates[0].method, Method::POST);
        assert_eq!(
            templates[0].headers.get(header::CONTENT_LENGTH).unwrap(),
            "7"
        );
    }

    #[test]
    fn connection_close_detection() {
        let resp = Response::builder()
            .header(header::CONNECTION, "close")
            .body(())
            .unwrap();
        assert!(closes_connection(&resp));

        let resp = Response::builder()
            .header(header::CONNECTION, "keep-alive")
            .body(())
            .unwrap();
        assert!(!closes_connection(&resp));

        let resp = Response::builder()
            .version(Version::HTTP_10)
            .body(())
            .unwrap();
        assert!(closes_connection(&resp));
    }
}
