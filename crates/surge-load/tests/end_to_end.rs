//! End-to-end runs against loopback servers, one per protocol engine.
//!
//! The request gates are process-wide, so every test takes the same lock
//! before driving the engine.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use clap::Parser;
use surge_core::config::TargetAddr;
use surge_load::cli::{build_config, Args};
use surge_load::Summary;

static RUN_LOCK: Mutex<()> = Mutex::new(());

fn run_with_args(argv: &[&str]) -> Summary {
    let mut full = vec!["surge"];
    full.extend_from_slice(argv);
    let config = build_config(Args::parse_from(full)).expect("config");
    surge_load::run(config).expect("run")
}

fn spawn_server<F, Fut>(serve: F) -> SocketAddr
where
    F: FnOnce(TcpListener) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("server runtime");
        rt.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            tx.send(listener.local_addr().expect("local addr")).ok();
            serve(listener).await;
        });
    });
    rx.recv().expect("server addr")
}

async fn hello(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(Response::new(Full::new(Bytes::from_static(b"hello"))))
}

async fn hello_and_close(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(Response::builder()
        .header("connection", "close")
        .body(Full::new(Bytes::from_static(b"bye")))
        .unwrap())
}

fn start_http1_server(close_per_request: bool) -> SocketAddr {
    spawn_server(move |listener| async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let result = if close_per_request {
                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(hello_and_close))
                        .await
                } else {
                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(hello))
                        .await
                };
                drop(result);
            });
        }
    })
}

fn start_http2_server() -> SocketAddr {
    spawn_server(|listener| async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service_fn(hello))
                    .await;
            });
        }
    })
}

fn start_bolt_server() -> SocketAddr {
    spawn_server(|listener| async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let mut head = [0u8; surge_core::bolt::REQUEST_HEADER_LEN];
                loop {
                    if rd.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    let request_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]);
                    let class_len = u16::from_be_bytes([head[14], head[15]]) as usize;
                    let header_len = u16::from_be_bytes([head[16], head[17]]) as usize;
                    let content_len =
                        u32::from_be_bytes([head[18], head[19], head[20], head[21]]) as usize;

                    let mut body = vec![0u8; class_len + header_len + content_len];
                    if rd.read_exact(&mut body).await.is_err() {
                        return;
                    }

                    let resp = surge_core::bolt::encode_response_head(
                        request_id,
                        surge_core::bolt::status::SUCCESS,
                        0,
                    );
                    if wr.write_all(&resp).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}

#[test]
fn fixed_count_http1() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let addr = start_http1_server(false);
    let url = format!("http://{addr}/");

    let summary = run_with_args(&["-n", "20", "-c", "2", "-t", "1", "-p", "http/1.1", &url]);

    assert_eq!(summary.req_done, 20);
    assert_eq!(summary.req_success, 20);
    assert_eq!(summary.req_status_success, 20);
    assert_eq!(summary.status_2xx, 20);
    assert_eq!(summary.req_failed, 0);
    assert_eq!(summary.req_error, 0);
    assert!(summary.bytes_body >= 20 * 5);
    assert!(summary.request_time.mean > 0.0);
}

#[test]
fn fixed_count_multiplexed_burst() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let addr = start_http2_server();
    let url = format!("http://{addr}/");

    let summary = run_with_args(&[
        "-n", "100", "-c", "2", "-t", "2", "-m", "10", "-p", "h2c", &url,
    ]);

    assert_eq!(summary.req_done, 100);
    assert_eq!(summary.req_status_success, 100);
    assert_eq!(summary.status_2xx, 100);
    assert_eq!(summary.req_failed, 0);
    // Percentiles are monotonic over the recorded latencies.
    let ps: Vec<u64> = summary.latency_percentiles.iter().map(|&(_, us)| us).collect();
    assert!(ps.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn connection_close_triggers_reconnect() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let addr = start_http1_server(true);
    let url = format!("http://{addr}/");

    let summary = run_with_args(&["-n", "3", "-c", "1", "-t", "1", "-p", "http/1.1", &url]);

    assert_eq!(summary.req_done, 3);
    assert_eq!(summary.req_status_success, 3);
    assert_eq!(summary.req_failed, 0);
}

#[test]
fn framed_binary_roundtrip() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let addr = start_bolt_server();
    let url = format!("http://{addr}/");

    let summary = run_with_args(&["-n", "10", "-c", "1", "-t", "1", "-p", "sofarpc", &url]);

    assert_eq!(summary.req_done, 10);
    assert_eq!(summary.req_status_success, 10);
    assert_eq!(summary.rpc_status[0], 10);
    assert!(summary.rpc_breakdown);
}

#[test]
fn unreachable_host_counts_all_requests_failed() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // Port 1 on loopback refuses immediately.
    let summary = run_with_args(&["-n", "10", "-c", "5", "-t", "1", "http://127.0.0.1:1/"]);

    assert_eq!(summary.req_status_success, 0);
    assert_eq!(summary.req_failed, 10);
    assert_eq!(summary.req_error, 10);
}

#[test]
fn address_failover_skips_dead_address() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let good = start_http1_server(false);
    let url = format!("http://{good}/");

    let mut config = build_config(Args::parse_from([
        "surge", "-n", "5", "-c", "1", "-t", "1", "-p", "http/1.1", &url,
    ]))
    .expect("config");
    // Prepend a dead address; the client must fail over without
    // charging a request.
    config.addr = TargetAddr::Tcp(vec!["127.0.0.1:1".parse().unwrap(), good]);

    let summary = surge_load::run(config).expect("run");
    assert_eq!(summary.req_status_success, 5);
    assert_eq!(summary.req_failed, 0);
}

#[test]
fn qps_run_respects_request_cap() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let addr = start_http1_server(false);
    let url = format!("http://{addr}/");

    let summary = run_with_args(&[
        "-n", "1", "-c", "2", "-t", "1", "-p", "http/1.1", "--qps", "100", "-D", "1", &url,
    ]);

    assert_eq!(summary.total_requests, 100);
    assert!(summary.req_done >= 1, "no requests completed");
    // The refill ticker may wrap into a second pass before the duration
    // timer lands, so allow a small stochastic overshoot.
    assert!(summary.req_done <= 110, "qps cap exceeded: {}", summary.req_done);
}

#[test]
fn warmup_excludes_early_traffic() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let addr = start_http1_server(false);
    let url = format!("http://{addr}/");

    let summary = run_with_args(&[
        "-c",
        "2",
        "-t",
        "1",
        "-p",
        "http/1.1",
        "-D",
        "1",
        "--warm-up-time",
        "1",
        &url,
    ]);

    assert_eq!(summary.duration_secs, 1.0);
    assert!(summary.req_done > 0, "measurement window produced nothing");
    // Every accounted request belongs to the measurement window.
    assert_eq!(summary.req_done, summary.req_success + summary.req_failed);
}
