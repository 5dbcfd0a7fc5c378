use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Error};
use bytes::Bytes;

use crate::bolt::BoltFixture;

/// QPS token refill period. The per-second budget is spread over
/// `QPS_UPDATES_PER_SECOND` slots of this width.
pub const QPS_UPDATE_PERIOD_MS: u64 = 5;
pub const QPS_UPDATES_PER_SECOND: usize = (1000 / QPS_UPDATE_PERIOD_MS) as usize;

pub const DEFAULT_NPN_LIST: &str = "h2,h2-16,h2-14,http/1.1";

/// Application protocol used on plaintext connections (`-p`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http2,
    Http11,
    SofaRpc,
}

impl Proto {
    pub fn ident(self) -> &'static str {
        match self {
            Proto::Http2 => "h2c",
            Proto::Http11 => "http/1.1",
            Proto::SofaRpc => "sofarpc",
        }
    }
}

impl FromStr for Proto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "h2c" | "h2" => Ok(Proto::Http2),
            "http/1.1" => Ok(Proto::Http11),
            "sofarpc" => Ok(Proto::SofaRpc),
            other => Err(anyhow!("-p: unsupported protocol {other}")),
        }
    }
}

/// Resolved target. `unix:PATH` URIs produce a filesystem socket address;
/// everything else resolves to one or more TCP addresses tried in order.
#[derive(Debug, Clone)]
pub enum TargetAddr {
    Tcp(Vec<SocketAddr>),
    Unix(PathBuf),
}

/// Immutable run configuration. Built once at startup, shared across
/// workers behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub default_port: u16,
    pub addr: TargetAddr,

    pub nreqs: u64,
    pub nclients: usize,
    pub nthreads: usize,
    pub max_concurrent_streams: usize,

    pub rate: usize,
    pub rate_period: Duration,
    /// Zero means the run is not timing based.
    pub duration: Duration,
    pub warm_up_time: Duration,
    pub conn_active_timeout: Option<Duration>,
    pub conn_inactivity_timeout: Option<Duration>,
    pub qps: u64,

    pub no_tls_proto: Proto,
    pub npn_list: Vec<String>,

    /// Request lines (path + query), cycled per client.
    pub reqlines: Vec<String>,
    /// Shared pseudo-header/header set, already merged with `-H` overrides.
    pub shared_headers: Vec<(String, String)>,
    /// POST body, read from `-d` at startup.
    pub data: Option<Bytes>,

    pub header_table_size: u32,
    pub encoder_header_table_size: u32,

    pub rpc: BoltFixture,

    pub verbose: bool,
}

impl Config {
    pub fn is_qps_mode(&self) -> bool {
        self.qps != 0
    }

    pub fn is_rate_mode(&self) -> bool {
        self.rate != 0
    }

    pub fn is_timing_based_mode(&self) -> bool {
        !self.duration.is_zero()
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Total number of requests the admission gate starts from.
    /// Timing-based runs without QPS are unbounded; QPS runs are capped
    /// at `duration * qps`.
    pub fn total_requests_gate(&self) -> i64 {
        if self.is_timing_based_mode() {
            if self.is_qps_mode() {
                (self.duration.as_secs() * self.qps) as i64
            } else {
                i64::MAX
            }
        } else {
            self.nreqs as i64
        }
    }
}
