use std::time::{Duration, Instant, SystemTime};

/// Per-request timing record. `completed` is only set for requests whose
/// stream closed successfully inside the measurement window.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStat {
    pub request_time: Option<Instant>,
    pub request_wall_time: Option<SystemTime>,
    pub stream_close_time: Option<Instant>,
    pub status: u16,
    pub completed: bool,
}

impl RequestStat {
    pub fn request_duration(&self) -> Option<Duration> {
        match (self.request_time, self.stream_close_time) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

/// Per-client connection timings. `client_start_time`, `connect_start_time`,
/// `connect_time` and `ttfb` are assigned once per connection episode;
/// `client_end_time` is overwritten on every disconnect so that repeated
/// connect/disconnect cycles (http/1.1 without keep-alive) keep the last one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStat {
    pub client_start_time: Option<Instant>,
    pub client_end_time: Option<Instant>,
    pub connect_start_time: Option<Instant>,
    pub connect_time: Option<Instant>,
    pub ttfb: Option<Instant>,
    pub req_success: u64,
}

impl ClientStat {
    /// Recorded only once, at the very first connection attempt.
    pub fn record_client_start_time(&mut self) {
        if self.client_start_time.is_none() {
            self.client_start_time = Some(Instant::now());
        }
    }

    pub fn record_client_end_time(&mut self) {
        self.client_end_time = Some(Instant::now());
    }

    pub fn record_connect_start_time(&mut self) {
        self.connect_start_time = Some(Instant::now());
    }

    pub fn record_connect_time_at(&mut self, at: Instant) {
        self.connect_time = Some(at);
    }

    /// First response byte since connect start; never overwritten.
    pub fn record_ttfb_at(&mut self, at: Instant) {
        if self.ttfb.is_none() {
            self.ttfb = Some(at);
        }
    }

    pub fn clear_connect_times(&mut self) {
        self.connect_start_time = None;
        self.connect_time = None;
        self.ttfb = None;
    }
}

/// Slots in the dense RPC status histogram. Bolt status codes top out at
/// 18 (`SERVER_DESERIAL_EXCEPTION`); everything larger is clamped into
/// the last slot.
pub const RPC_STATUS_SLOTS: usize = 32;

/// Per-worker statistics, merged element-wise by the aggregator after all
/// workers join.
#[derive(Debug, Clone)]
pub struct Stats {
    pub req_started: u64,
    pub req_done: u64,
    pub req_success: u64,
    pub req_status_success: u64,
    pub req_failed: u64,
    pub req_error: u64,
    pub req_timedout: u64,

    pub bytes_total: u64,
    pub bytes_head: u64,
    pub bytes_head_decomp: u64,
    pub bytes_body: u64,

    /// HTTP status class histogram, indexed by `status / 100`.
    pub status: [u64; 6],
    /// Dense RPC status-code histogram for the framed binary dialect.
    pub rpc_status: [u64; RPC_STATUS_SLOTS],

    pub req_stats: Vec<RequestStat>,
    pub client_stats: Vec<ClientStat>,
    /// Round-trip times in microseconds for the latency distribution.
    pub rtts: Vec<u64>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            req_started: 0,
            req_done: 0,
            req_success: 0,
            req_status_success: 0,
            req_failed: 0,
            req_error: 0,
            req_timedout: 0,
            bytes_total: 0,
            bytes_head: 0,
            bytes_head_decomp: 0,
            bytes_body: 0,
            status: [0; 6],
            rpc_status: [0; RPC_STATUS_SLOTS],
            req_stats: Vec::new(),
            client_stats: Vec::new(),
            rtts: Vec::new(),
        }
    }
}

impl Stats {
    pub fn record_rtt(&mut self, rtt_us: u64) {
        self.rtts.push(rtt_us);
    }

    pub fn merge_from(&mut self, other: Stats) {
        self.req_started += other.req_started;
        self.req_done += other.req_done;
        self.req_success += other.req_success;
        self.req_status_success += other.req_status_success;
        self.req_failed += other.req_failed;
        self.req_error += other.req_error;
        self.req_timedout += other.req_timedout;

        self.bytes_total += other.bytes_total;
        self.bytes_head += other.bytes_head;
        self.bytes_head_decomp += other.bytes_head_decomp;
        self.bytes_body += other.bytes_body;

        for (dst, src) in self.status.iter_mut().zip(other.status.iter()) {
            *dst += src;
        }
        for (dst, src) in self.rpc_status.iter_mut().zip(other.rpc_status.iter()) {
            *dst += src;
        }

        self.req_stats.extend(other.req_stats);
        self.client_stats.extend(other.client_stats);
        self.rtts.extend(other.rtts);
    }
}

/// min/max/mean/standard deviation plus the percentage of samples falling
/// inside `[mean - sd, mean + sd]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct SDStat {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sd: f64,
    pub within_sd: f64,
}

/// Welford's incremental variance. Sample variance when `sampling` is set,
/// population variance otherwise.
pub fn compute_sd_stat(samples: &[f64], sampling: bool) -> SDStat {
    if samples.is_empty() {
        return SDStat::default();
    }

    let mut a = 0.0f64;
    let mut q = 0.0f64;
    let mut n = 0usize;
    let mut sum = 0.0f64;
    let mut min = f64::MAX;
    let mut max = f64::MIN;

    for &t in samples {
        n += 1;
        min = min.min(t);
        max = max.max(t);
        sum += t;

        let na = a + (t - a) / n as f64;
        q += (t - a) * (t - na);
        a = na;
    }

    let mean = sum / n as f64;
    let denom = if sampling && n > 1 { n - 1 } else { n };
    let sd = (q / denom as f64).sqrt();

    let lower = mean - sd;
    let upper = mean + sd;
    let m = samples.iter().filter(|&&t| lower <= t && t <= upper).count();
    let within_sd = (m as f64 / n as f64) * 100.0;

    SDStat {
        min,
        max,
        mean,
        sd,
        within_sd,
    }
}

/// Dense microsecond histogram spanning `[min, max]` over the recorded
/// RTTs, used for the latency percentile distribution.
#[derive(Debug)]
pub struct RttHistogram {
    min: u64,
    max: u64,
    counts: Vec<u64>,
    total: u64,
    invalid: bool,
}

impl RttHistogram {
    pub fn build<'a, I>(worker_rtts: I) -> Self
    where
        I: IntoIterator<Item = &'a [u64]> + Clone,
    {
        let mut min = u64::MAX;
        let mut max = u64::MIN;
        let mut total = 0u64;
        for rtts in worker_rtts.clone() {
            for &rtt in rtts {
                min = min.min(rtt);
                max = max.max(rtt);
                total += 1;
            }
        }

        if total == 0 {
            return Self {
                min: 0,
                max: 0,
                counts: vec![0],
                total: 0,
                invalid: true,
            };
        }

        let mut counts = vec![0u64; (max - min + 1) as usize];
        for rtts in worker_rtts {
            for &rtt in rtts {
                counts[(rtt - min) as usize] += 1;
            }
        }

        Self {
            min,
            max,
            counts,
            total,
            invalid: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invalid
    }

    /// Reported value is the first bucket whose running total reaches the
    /// rank `round(p/100 * count + 0.5)`.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.invalid {
            return 0;
        }
        let rank = ((p / 100.0) * self.total as f64 + 0.5).round() as u64;
        let mut running = 0u64;
        for (i, &c) in self.counts.iter().enumerate() {
            running += c;
            if running >= rank {
                return self.min + i as u64;
            }
        }
        self.max
    }
}

/// The percentile set reported by the latency distribution table.
pub const REPORT_PERCENTILES: [f64; 5] = [50.0, 75.0, 90.0, 95.0, 99.0];
