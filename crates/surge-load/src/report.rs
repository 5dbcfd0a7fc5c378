//! Cross-worker aggregation and the final report.

use std::time::Duration;

use serde::Serialize;

use surge_core::config::{Config, Proto};
use surge_core::stats::{
    compute_sd_stat, RttHistogram, SDStat, Stats, REPORT_PERCENTILES, RPC_STATUS_SLOTS,
};
use surge_core::util::{format_duration_secs, format_unit};

use crate::worker;

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub duration_secs: f64,
    pub rps: f64,
    pub bps: f64,

    pub total_requests: u64,
    pub req_started: u64,
    pub req_done: u64,
    pub req_success: u64,
    pub req_status_success: u64,
    pub req_failed: u64,
    pub req_error: u64,
    pub req_timedout: u64,

    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub rpc_status: Vec<u64>,
    pub rpc_breakdown: bool,

    pub bytes_total: u64,
    pub bytes_head: u64,
    pub bytes_head_decomp: u64,
    pub bytes_body: u64,
    pub header_space_savings: f64,

    pub request_time: SDStat,
    pub connect_time: SDStat,
    pub time_to_first_byte: SDStat,
    pub rps_per_client: SDStat,

    /// `(percentile, latency in microseconds)` pairs.
    pub latency_percentiles: Vec<(f64, u64)>,
}

/// Merge the per-worker statistics and compute the derived figures.
pub fn aggregate(config: &Config, mut stats: Stats, wall: Duration) -> Summary {
    // Requests that were never issued because their client lost its
    // connection are charged to failed/errored, fixed-count mode only.
    if !config.is_timing_based_mode() && !config.is_qps_mode() {
        let issued = stats.req_status_success + stats.req_failed;
        let not_issued = config.nreqs.saturating_sub(issued);
        stats.req_failed += not_issued;
        stats.req_error += not_issued;
    }

    // Warm-up time is excluded by construction: only the measurement
    // window produces samples, so a timing run divides by -D.
    let measured_secs = if config.is_timing_based_mode() {
        config.duration.as_secs_f64()
    } else {
        wall.as_secs_f64()
    };
    let (rps, bps) = if measured_secs > 0.0 {
        (
            stats.req_success as f64 / measured_secs,
            stats.bytes_total as f64 / measured_secs,
        )
    } else {
        (0.0, 0.0)
    };

    let total_requests = if !config.is_timing_based_mode() {
        config.nreqs
    } else if config.is_qps_mode() {
        config.duration.as_secs() * config.qps
    } else {
        worker::total_req_sent()
    };

    let request_times: Vec<f64> = stats
        .req_stats
        .iter()
        .filter(|r| r.completed)
        .filter_map(|r| r.request_duration())
        .map(|d| d.as_secs_f64())
        .collect();

    let mut connect_times = Vec::new();
    let mut ttfb_times = Vec::new();
    let mut rps_values = Vec::new();
    for cstat in &stats.client_stats {
        if let (Some(start), Some(end)) = (cstat.client_start_time, cstat.client_end_time) {
            let t = end.saturating_duration_since(start).as_secs_f64();
            if t > 1e-9 {
                rps_values.push(cstat.req_success as f64 / t);
            }
        }

        // The connect event precedes the first byte, so a missing
        // connect time short-circuits both samples.
        let (Some(cs), Some(ct)) = (cstat.connect_start_time, cstat.connect_time) else {
            continue;
        };
        connect_times.push(ct.saturating_duration_since(cs).as_secs_f64());

        if let Some(ttfb) = cstat.ttfb {
            ttfb_times.push(ttfb.saturating_duration_since(cs).as_secs_f64());
        }
    }

    let hist = RttHistogram::build([stats.rtts.as_slice()]);
    let latency_percentiles = REPORT_PERCENTILES
        .iter()
        .map(|&p| (p, hist.percentile(p)))
        .collect();

    let header_space_savings = if stats.bytes_head_decomp > 0 {
        1.0 - stats.bytes_head as f64 / stats.bytes_head_decomp as f64
    } else {
        0.0
    };

    Summary {
        duration_secs: measured_secs,
        rps,
        bps,
        total_requests,
        req_started: stats.req_started,
        req_done: stats.req_done,
        req_success: stats.req_success,
        req_status_success: stats.req_status_success,
        req_failed: stats.req_failed,
        req_error: stats.req_error,
        req_timedout: stats.req_timedout,
        status_2xx: stats.status[2],
        status_3xx: stats.status[3],
        status_4xx: stats.status[4],
        status_5xx: stats.status[5],
        rpc_status: stats.rpc_status.to_vec(),
        rpc_breakdown: config.no_tls_proto == Proto::SofaRpc && !config.is_tls(),
        bytes_total: stats.bytes_total,
        bytes_head: stats.bytes_head,
        bytes_head_decomp: stats.bytes_head_decomp,
        bytes_body: stats.bytes_body,
        header_space_savings,
        request_time: compute_sd_stat(&request_times, false),
        connect_time: compute_sd_stat(&connect_times, false),
        time_to_first_byte: compute_sd_stat(&ttfb_times, false),
        rps_per_client: compute_sd_stat(&rps_values, false),
        latency_percentiles,
    }
}

fn sd_row(label: &str, st: &SDStat, as_duration: bool) -> String {
    let fmt = |v: f64| {
        if as_duration {
            format_duration_secs(v)
        } else {
            format!("{v:.2}")
        }
    };
    format!(
        "{label}{:>10}  {:>10}  {:>10}  {:>10}{:>8.2}%",
        fmt(st.min),
        fmt(st.max),
        fmt(st.mean),
        fmt(st.sd),
        st.within_sd
    )
}

pub fn print_report(s: &Summary) {
    println!(
        "\nfinished in {}, {:.2} req/s, {}B/s",
        format_duration_secs(s.duration_secs),
        s.rps,
        format_unit(s.bps)
    );
    println!(
        "requests: {} total, {} started, {} done, {} succeeded, {} failed, {} errored, {} timeout",
        s.total_requests,
        s.req_started,
        s.req_done,
        s.req_status_success,
        s.req_failed,
        s.req_error,
        s.req_timedout
    );

    if s.rpc_breakdown {
        use surge_core::bolt::status::*;
        let c = |code: u16| s.rpc_status[(code as usize).min(RPC_STATUS_SLOTS - 1)];
        println!(
            "rpc status codes: \n\t{} success, {} error, {} server exception, {} unknown\n\t{} server threadpool busy, {} error comm, {} no processor, {} timeout\n\t{} client send error, {} codec exception, {} connection closed, {} server serial exception\n\t{} server deserial exception",
            c(SUCCESS),
            c(ERROR),
            c(SERVER_EXCEPTION),
            c(UNKNOWN),
            c(SERVER_THREADPOOL_BUSY),
            c(ERROR_COMM),
            c(NO_PROCESSOR),
            c(TIMEOUT),
            c(CLIENT_SEND_ERROR),
            c(CODEC_EXCEPTION),
            c(CONNECTION_CLOSED),
            c(SERVER_SERIAL_EXCEPTION),
            c(SERVER_DESERIAL_EXCEPTION)
        );
    } else {
        println!(
            "status codes: {} 2xx, {} 3xx, {} 4xx, {} 5xx",
            s.status_2xx, s.status_3xx, s.status_4xx, s.status_5xx
        );
    }

    println!(
        "traffic: {}B ({}) total, {}B ({}) headers (space savings {:.2}%), {}B ({}) data",
        format_unit(s.bytes_total as f64),
        s.bytes_total,
        format_unit(s.bytes_head as f64),
        s.bytes_head,
        s.header_space_savings * 100.0,
        format_unit(s.bytes_body as f64),
        s.bytes_body
    );

    println!("                     min         max        mean          sd   +/- sd");
    println!("{}", sd_row("time for request: ", &s.request_time, true));
    println!("{}", sd_row("time for connect: ", &s.connect_time, true));
    println!("{}", sd_row("time to 1st byte: ", &s.time_to_first_byte, true));
    println!("{}", sd_row("req/s           : ", &s.rps_per_client, false));

    println!("\n  Latency  Distribution");
    for (p, us) in &s.latency_percentiles {
        println!(
            "{:>5.0}%{:>13}",
            p,
            format_duration_secs(*us as f64 / 1_000_000.0)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use surge_core::bolt::BoltFixture;
    use surge_core::config::TargetAddr;
    use surge_core::stats::{ClientStat, RequestStat};

    fn fixed_count_config(nreqs: u64) -> Config {
        Config {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 80,
            default_port: 80,
            addr: TargetAddr::Tcp(vec!["127.0.0.1:80".parse().unwrap()]),
            nreqs,
            nclients: 1,
            nthreads: 1,
            max_concurrent_streams: 1,
            rate: 0,
            rate_period: Duration::from_secs(1),
            duration: Duration::ZERO,
            warm_up_time: Duration::ZERO,
            conn_active_timeout: None,
            conn_inactivity_timeout: None,
            qps: 0,
            no_tls_proto: Proto::Http2,
            npn_list: vec!["h2".to_string()],
            reqlines: vec!["/".to_string()],
            shared_headers: Vec::new(),
            data: None,
            header_table_size: 4096,
            encoder_header_table_size: 4096,
            rpc: BoltFixture::default(),
            verbose: false,
        }
    }

    #[test]
    fn unissued_requests_are_charged_as_failures() {
        // 10 requested, 4 carried a success status, 2 already failed:
        // the missing 4 become failed + errored.
        let config = fixed_count_config(10);
        let mut stats = Stats::default();
        stats.req_status_success = 4;
        stats.req_failed = 2;
        stats.req_error = 2;

        let summary = aggregate(&config, stats, Duration::from_secs(1));
        assert_eq!(summary.req_failed, 6);
        assert_eq!(summary.req_error, 6);
    }

    #[test]
    fn timing_mode_divides_by_configured_duration() {
        let mut config = fixed_count_config(0);
        config.nreqs = 1;
        config.duration = Duration::from_secs(2);

        let mut stats = Stats::default();
        stats.req_success = 100;
        stats.bytes_total = 2000;

        let summary = aggregate(&config, stats, Duration::from_secs(5));
        assert_eq!(summary.duration_secs, 2.0);
        assert!((summary.rps - 50.0).abs() < 1e-9);
        assert!((summary.bps - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn derived_samples_respect_recorded_fields() {
        let config = fixed_count_config(1);
        let mut stats = Stats::default();

        let t0 = Instant::now();
        let mut req = RequestStat::default();
        req.request_time = Some(t0);
        req.stream_close_time = Some(t0 + Duration::from_millis(10));
        req.completed = true;
        stats.req_stats.push(req);

        // A client that never recorded a connect time contributes no
        // connect or ttfb sample.
        let mut c = ClientStat::default();
        c.client_start_time = Some(t0);
        c.client_end_time = Some(t0 + Duration::from_secs(1));
        c.req_success = 5;
        stats.client_stats.push(c);

        stats.req_status_success = 1;
        stats.rtts.push(10_000);

        let summary = aggregate(&config, stats, Duration::from_secs(1));
        assert!((summary.request_time.mean - 0.010).abs() < 1e-6);
        assert_eq!(summary.connect_time, SDStat::default());
        assert_eq!(summary.time_to_first_byte, SDStat::default());
        assert!((summary.rps_per_client.mean - 5.0).abs() < 0.5);
        assert_eq!(summary.latency_percentiles[0], (50.0, 10_000));
    }

    #[test]
    fn qps_total_is_duration_times_rate() {
        let mut config = fixed_count_config(1);
        config.duration = Duration::from_secs(4);
        config.qps = 500;
        let summary = aggregate(&config, Stats::default(), Duration::from_secs(5));
        assert_eq!(summary.total_requests, 2000);
    }
}
