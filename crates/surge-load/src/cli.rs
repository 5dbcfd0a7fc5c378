use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;

use surge_core::bolt::BoltFixture;
use surge_core::config::{Config, Proto, TargetAddr, DEFAULT_NPN_LIST};
use surge_core::request::{
    self, build_shared_headers, parse_header_arg, parse_uris, UNIX_PATH_PREFIX,
};
use surge_core::util::{parse_duration_unit, parse_size_unit};

const USER_AGENT: &str = concat!("surge/", env!("CARGO_PKG_VERSION"));

/// Benchmarking tool for HTTP/2, HTTP/1.1 and sofarpc servers.
#[derive(Parser, Debug)]
#[command(name = "surge", version, about)]
pub struct Args {
    /// URIs to access. The scheme, host and port of the first URI are
    /// used for every connection; subsequent URIs contribute only their
    /// path and query, cycled per client. `unix:PATH` targets a
    /// filesystem socket.
    #[arg(value_name = "URI")]
    pub uris: Vec<String>,

    /// Number of requests across all clients.
    #[arg(short = 'n', long = "requests", default_value_t = 1)]
    pub requests: u64,

    /// Number of concurrent clients. With -r this is the maximum number
    /// of connections to be made.
    #[arg(short = 'c', long = "clients", default_value_t = 1)]
    pub clients: usize,

    /// Number of native threads.
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: usize,

    /// Max concurrent streams to issue per session.
    #[arg(short = 'm', long = "max-concurrent-streams", default_value_t = 1)]
    pub max_concurrent_streams: usize,

    /// Add/override a header to the requests.
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    /// Protocol to use when accessing an http URI without TLS
    /// (h2c, http/1.1 or sofarpc).
    #[arg(short = 'p', long = "no-tls-proto", default_value = "h2c")]
    pub no_tls_proto: String,

    /// POST the content of FILE to the server; switches the method to POST.
    #[arg(short = 'd', long = "data", value_name = "FILE")]
    pub data: Option<PathBuf>,

    /// Fixed rate at which connections are created, per rate period.
    /// Mutually exclusive with -D.
    #[arg(short = 'r', long = "rate")]
    pub rate: Option<usize>,

    /// Period between creating connections, e.g. 1s or 500ms.
    #[arg(long = "rate-period", default_value = "1s", value_name = "DURATION")]
    pub rate_period: String,

    /// Main measurement duration in seconds for timing-based benchmarking.
    /// Mutually exclusive with -r.
    #[arg(short = 'D', long = "duration", value_name = "N")]
    pub duration: Option<u64>,

    /// Warm-up period before the measurement window; needs -D.
    #[arg(long = "warm-up-time", default_value = "0", value_name = "DURATION")]
    pub warm_up_time: String,

    /// Maximum time to keep a connection open, regardless of activity.
    #[arg(short = 'T', long = "connection-active-timeout", value_name = "DURATION")]
    pub connection_active_timeout: Option<String>,

    /// Maximum time to wait for activity on a connection.
    #[arg(short = 'N', long = "connection-inactivity-timeout", value_name = "DURATION")]
    pub connection_inactivity_timeout: Option<String>,

    /// Target queries per second, spread across all threads; requires -D
    /// and is mutually exclusive with -r.
    #[arg(long = "qps", value_name = "N")]
    pub qps: Option<u64>,

    /// Shorthand for --npn-list=http/1.1 --no-tls-proto=http/1.1.
    #[arg(long = "h1", default_value_t = false)]
    pub h1: bool,

    /// Comma-separated ALPN identifiers to offer, in preference order.
    #[arg(long = "npn-list", value_name = "LIST")]
    pub npn_list: Option<String>,

    /// Decoder header table size.
    #[arg(long = "header-table-size", default_value = "4K", value_name = "SIZE")]
    pub header_table_size: String,

    /// Encoder header table size.
    #[arg(long = "encoder-header-table-size", default_value = "4K", value_name = "SIZE")]
    pub encoder_header_table_size: String,

    /// Read URIs from a file, one per line; `-` reads standard input.
    #[arg(short = 'i', long = "input-file", value_name = "PATH")]
    pub input_file: Option<String>,

    /// RPC request class name for the sofarpc protocol.
    #[arg(long = "rpc-class-name", value_name = "NAME")]
    pub rpc_class_name: Option<String>,

    /// RPC header map for the sofarpc protocol, `key:value[,key:value]`.
    #[arg(long = "rpc-header", value_name = "MAP")]
    pub rpc_header: Option<String>,

    /// File whose content becomes the sofarpc request payload.
    #[arg(long = "rpc-content-file", value_name = "PATH")]
    pub rpc_content_file: Option<PathBuf>,

    /// RPC request timeout in milliseconds, carried in the frame header.
    #[arg(long = "rpc-timeout", default_value_t = 5000, value_name = "MS")]
    pub rpc_timeout_ms: u32,

    /// Emit the summary as JSON instead of the human-readable report.
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,

    /// Output debug information.
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    pub verbose: bool,
}

fn parse_opt_duration(arg: &Option<String>, opt: &str) -> Result<Option<Duration>> {
    match arg {
        None => Ok(None),
        Some(s) => {
            let d = parse_duration_unit(s).with_context(|| format!("{opt}: bad value: {s}"))?;
            Ok(if d.is_zero() { None } else { Some(d) })
        }
    }
}

/// Validate the arguments and assemble the immutable run configuration.
/// Every rejected combination exits with a one-line error.
pub fn build_config(args: Args) -> Result<Config> {
    let mut uris = args.uris;
    if let Some(path) = &args.input_file {
        let contents = if path == "-" {
            std::io::read_to_string(std::io::stdin()).context("cannot read standard input")?
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("cannot read input file: {path}"))?
        };
        uris.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
    if uris.is_empty() {
        bail!("no URI or input file given");
    }

    if args.clients == 0 {
        bail!("-c: the number of clients must be strictly greater than 0");
    }
    if args.max_concurrent_streams == 0 {
        bail!("-m: the max concurrent streams must be strictly greater than 0");
    }
    if args.threads == 0 {
        bail!("-t: the number of threads must be strictly greater than 0");
    }

    let duration = Duration::from_secs(args.duration.unwrap_or(0));
    let qps = args.qps.unwrap_or(0);
    let rate = args.rate.unwrap_or(0);

    if args.rate == Some(0) {
        bail!("-r: the rate at which connections are made must be positive");
    }
    if let Some(d) = args.duration {
        if d == 0 {
            bail!("-D: the main duration for timing-based benchmarking must be positive");
        }
    }
    if qps != 0 && rate != 0 {
        bail!("-r, --qps: they are mutually exclusive");
    }
    if qps != 0 && duration.is_zero() {
        bail!("--qps: duration (-D) must be positive in qps mode");
    }
    if !duration.is_zero() && rate != 0 {
        bail!("-r, -D: they are mutually exclusive");
    }
    if args.requests == 0 && duration.is_zero() {
        bail!("-n: the number of requests must be strictly greater than 0 if a timing-based test is not being run");
    }
    if args.clients < args.threads && qps == 0 {
        bail!("-c, -t: the number of clients must be greater than or equal to the number of threads");
    }
    if rate != 0 {
        if rate < args.threads {
            bail!("-r, -t: the connection rate must be greater than or equal to the number of threads");
        }
        if rate > args.clients {
            bail!("-r, -c: the connection rate must be smaller than or equal to the number of clients");
        }
    }

    if let Ok(cores) = std::thread::available_parallelism() {
        if args.threads > cores.get() {
            eprintln!("-t: warning: the number of threads is greater than hardware cores");
        }
    }

    let warm_up_time = parse_duration_unit(&args.warm_up_time)
        .with_context(|| format!("--warm-up-time: value error {}", args.warm_up_time))?;
    let rate_period = parse_duration_unit(&args.rate_period)
        .with_context(|| format!("--rate-period: value error {}", args.rate_period))?;
    let conn_active_timeout = parse_opt_duration(&args.connection_active_timeout, "-T")?;
    let conn_inactivity_timeout = parse_opt_duration(&args.connection_inactivity_timeout, "-N")?;

    let header_table_size = parse_size_unit(&args.header_table_size)
        .context("--header-table-size: bad option value")? as u32;
    let encoder_header_table_size = parse_size_unit(&args.encoder_header_table_size)
        .context("--encoder-header-table-size: bad option value")? as u32;

    let data = match &args.data {
        None => None,
        Some(path) => Some(Bytes::from(std::fs::read(path).with_context(|| {
            format!("-d: could not open file {}", path.display())
        })?)),
    };

    let mut custom_headers = Vec::with_capacity(args.headers.len());
    for h in &args.headers {
        custom_headers.push(parse_header_arg(h)?);
    }

    let mut no_tls_proto: Proto = args.no_tls_proto.parse()?;
    let mut npn_list: Vec<String> = args
        .npn_list
        .as_deref()
        .unwrap_or(DEFAULT_NPN_LIST)
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if args.h1 {
        npn_list = vec!["http/1.1".to_string()];
        no_tls_proto = Proto::Http11;
    }

    // unix:PATH bypasses URI parsing for the authority part.
    let (base, reqlines, addr) = if let Some(path) = uris[0].strip_prefix(UNIX_PATH_PREFIX) {
        let base = request::BaseUri {
            scheme: "http".to_string(),
            host: path.to_string(),
            port: 80,
            default_port: 80,
        };
        let mut reqlines = vec!["/".to_string()];
        for uri in &uris[1..] {
            reqlines.push(request::reqline(uri)?);
        }
        (base, reqlines, TargetAddr::Unix(PathBuf::from(path)))
    } else {
        let (base, reqlines) = parse_uris(&uris)?;
        let addrs: Vec<_> = (base.host.as_str(), base.port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve host: {}", base.host))?
            .collect();
        if addrs.is_empty() {
            bail!("no address returned for host: {}", base.host);
        }
        (base, reqlines, TargetAddr::Tcp(addrs))
    };

    // Don't DOS the upstream project's public server.
    if base.host == "nghttp2.org" {
        bail!("running against the public server {} is prohibited", base.host);
    }

    let shared_headers = build_shared_headers(
        &base,
        data.as_ref().map(Bytes::len),
        USER_AGENT,
        &custom_headers,
    );

    let mut rpc = BoltFixture::default();
    if let Some(name) = args.rpc_class_name {
        rpc.class_name = name;
    }
    if let Some(header) = args.rpc_header {
        rpc.header = header;
    }
    if let Some(path) = &args.rpc_content_file {
        rpc.content = Bytes::from(std::fs::read(path).with_context(|| {
            format!("--rpc-content-file: could not open file {}", path.display())
        })?);
    }
    rpc.timeout_ms = args.rpc_timeout_ms;

    Ok(Config {
        scheme: base.scheme.clone(),
        host: base.host.clone(),
        port: base.port,
        default_port: base.default_port,
        addr,
        nreqs: args.requests,
        nclients: args.clients,
        nthreads: args.threads,
        max_concurrent_streams: args.max_concurrent_streams,
        rate,
        rate_period,
        duration,
        warm_up_time,
        conn_active_timeout,
        conn_inactivity_timeout,
        qps,
        no_tls_proto,
        npn_list,
        reqlines,
        shared_headers,
        data,
        header_table_size,
        encoder_header_table_size,
        rpc,
        verbose: args.verbose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Config> {
        let mut full = vec!["surge"];
        full.extend_from_slice(argv);
        build_config(Args::parse_from(full))
    }

    #[test]
    fn minimal_invocation() {
        let cfg = parse(&["http://127.0.0.1:8080/"]).unwrap();
        assert_eq!(cfg.nreqs, 1);
        assert_eq!(cfg.nclients, 1);
        assert_eq!(cfg.reqlines, vec!["/"]);
        assert!(!cfg.is_tls());
    }

    #[test]
    fn missing_uri_is_rejected() {
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert!(parse(&["-c", "0", "http://127.0.0.1/"]).is_err());
        assert!(parse(&["-m", "0", "http://127.0.0.1/"]).is_err());
        assert!(parse(&["-t", "0", "http://127.0.0.1/"]).is_err());
        assert!(parse(&["-n", "0", "http://127.0.0.1/"]).is_err());
    }

    #[test]
    fn mutually_exclusive_modes() {
        assert!(parse(&["-r", "5", "-c", "10", "-D", "2", "http://127.0.0.1/"]).is_err());
        assert!(parse(&["-r", "5", "-c", "10", "--qps", "100", "http://127.0.0.1/"]).is_err());
        assert!(parse(&["--qps", "100", "http://127.0.0.1/"]).is_err());
    }

    #[test]
    fn rate_bounds_against_threads_and_clients() {
        assert!(parse(&["-r", "1", "-t", "2", "-c", "4", "http://127.0.0.1/"]).is_err());
        assert!(parse(&["-r", "8", "-c", "4", "http://127.0.0.1/"]).is_err());
        let cfg = parse(&["-r", "2", "-t", "2", "-c", "4", "http://127.0.0.1/"]).unwrap();
        assert_eq!(cfg.rate, 2);
    }

    #[test]
    fn clients_must_cover_threads_outside_qps() {
        assert!(parse(&["-c", "1", "-t", "2", "http://127.0.0.1/"]).is_err());
        // In qps mode the constraint is lifted.
        let cfg = parse(&[
            "-c",
            "1",
            "-t",
            "2",
            "--qps",
            "10",
            "-D",
            "1",
            "http://127.0.0.1/",
        ])
        .unwrap();
        assert!(cfg.is_qps_mode());
    }

    #[test]
    fn h1_shortcut_forces_http11() {
        let cfg = parse(&["--h1", "http://127.0.0.1/"]).unwrap();
        assert_eq!(cfg.no_tls_proto, Proto::Http11);
        assert_eq!(cfg.npn_list, vec!["http/1.1"]);
    }

    #[test]
    fn qps_mode_sets_request_gate() {
        let cfg = parse(&["--qps", "500", "-D", "4", "-c", "2", "http://127.0.0.1/"]).unwrap();
        assert_eq!(cfg.total_requests_gate(), 2000);
    }

    #[test]
    fn header_table_sizes_accept_units() {
        let cfg = parse(&["--header-table-size", "8K", "http://127.0.0.1/"]).unwrap();
        assert_eq!(cfg.header_table_size, 8192);
    }

    #[test]
    fn unix_target() {
        let cfg = parse(&["-p", "http/1.1", "unix:/tmp/test.sock"]).unwrap();
        match &cfg.addr {
            TargetAddr::Unix(p) => assert_eq!(p.to_str(), Some("/tmp/test.sock")),
            other => panic!("expected unix target, got {other:?}"),
        }
    }

    #[test]
    fn public_server_guard() {
        assert!(parse(&["http://nghttp2.org/"]).is_err());
    }
}
