//! Worker loop: one OS thread, one single-threaded runtime, one select
//! loop owning every piece of mutable per-worker state. Connection tasks
//! report events into the loop; the loop does all admission, phase and
//! accounting work, so no intra-worker locking exists anywhere.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use surge_core::config::{Config, QPS_UPDATE_PERIOD_MS};
use surge_core::stats::{ClientStat, RequestStat, Stats, RPC_STATUS_SLOTS};

use crate::client::{self, ClientCmd, ClientCtx, ClientEvent, TlsInfo};

/// Requests remaining to dispatch across the whole process. The
/// authoritative gate in non-QPS modes; fetch-sub races below zero are
/// tolerated (at most `threads - 1` extra submissions).
pub static TOTAL_REQ_LEFT: AtomicI64 = AtomicI64::new(0);
/// Requests issued across the whole process.
pub static TOTAL_REQ_SENT: AtomicU64 = AtomicU64::new(0);

/// The gates live for one run; re-arm them before reusing the engine.
pub fn init_request_gates(config: &Config) {
    TOTAL_REQ_LEFT.store(config.total_requests_gate(), Ordering::Relaxed);
    TOTAL_REQ_SENT.store(0, Ordering::Relaxed);
}

pub fn total_req_sent() -> u64 {
    TOTAL_REQ_SENT.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InitialIdle,
    WarmUp,
    MainDuration,
    DurationOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseFire {
    WarmupOver,
    DurationOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    Inactivity,
    ActiveDeadline,
}

/// Response-status resolution for one inflight stream:
/// -1 unresolved, 0 failed, 1 ok.
#[derive(Debug)]
struct Stream {
    stat: RequestStat,
    status_success: i8,
}

impl Stream {
    fn new() -> Self {
        Self {
            stat: RequestStat::default(),
            status_success: -1,
        }
    }
}

struct ClientSlot {
    cmd_tx: mpsc::Sender<ClientCmd>,
    alive: bool,
    connected: bool,
    /// Terminate/Stop already sent; suppresses duplicate teardown.
    stopping: bool,
    stat_drained: bool,
    timed_out: bool,
    current_addr: Option<usize>,
    max_streams: usize,
    next_stream_id: u64,
    req_inflight: u64,
    streams: HashMap<u64, Stream>,
    cstat: ClientStat,
    idle_deadline: Option<Instant>,
    idle_entry_live: bool,
    active_deadline: Option<Instant>,
    active_entry_live: bool,
    active_armed: bool,
}

impl ClientSlot {
    fn new(cmd_tx: mpsc::Sender<ClientCmd>) -> Self {
        Self {
            cmd_tx,
            alive: true,
            connected: false,
            stopping: false,
            stat_drained: false,
            timed_out: false,
            current_addr: None,
            max_streams: 1,
            next_stream_id: 0,
            req_inflight: 0,
            streams: HashMap::new(),
            cstat: ClientStat::default(),
            idle_deadline: None,
            idle_entry_live: false,
            active_deadline: None,
            active_entry_live: false,
            active_armed: false,
        }
    }
}

enum Submit {
    Issued,
    Blocked,
}

pub struct WorkerSeed {
    pub id: usize,
    pub config: Arc<Config>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub nclients: usize,
    pub rate: usize,
    pub qps_counts: Vec<u64>,
}

pub struct Worker {
    id: usize,
    config: Arc<Config>,
    tls: Option<Arc<rustls::ClientConfig>>,
    pub stats: Stats,
    phase: Phase,
    slots: Vec<ClientSlot>,
    nclients: usize,
    rate: usize,
    started: usize,
    live_clients: usize,
    qps_counts: Vec<u64>,
    qps_idx: usize,
    qps_left: u64,
    qps_running: bool,
    blocked_on_qps: Vec<usize>,
    phase_deadline: Option<(Instant, PhaseFire)>,
    timers: BinaryHeap<Reverse<(Instant, usize, TimerKind)>>,
    event_tx: mpsc::Sender<(usize, ClientEvent)>,
    break_loop: bool,
    app_info_reported: bool,
    tls_info_reported: bool,
}

impl Worker {
    pub fn run(seed: WorkerSeed) -> Result<Stats> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .context("build per-worker tokio runtime")?;

        rt.block_on(async move {
            let cap = (seed.nclients * 4).max(1024);
            let (event_tx, event_rx) = mpsc::channel(cap);
            let mut worker = Worker::new(seed, event_tx);
            worker.run_loop(event_rx).await;
            Ok(worker.stats)
        })
    }

    fn new(seed: WorkerSeed, event_tx: mpsc::Sender<(usize, ClientEvent)>) -> Self {
        let phase = if seed.config.is_timing_based_mode() {
            Phase::InitialIdle
        } else {
            Phase::MainDuration
        };

        Self {
            id: seed.id,
            config: seed.config,
            tls: seed.tls,
            stats: Stats::default(),
            phase,
            slots: Vec::with_capacity(seed.nclients),
            nclients: seed.nclients,
            rate: seed.rate,
            started: 0,
            live_clients: 0,
            qps_counts: seed.qps_counts,
            qps_idx: 0,
            qps_left: 0,
            qps_running: false,
            blocked_on_qps: Vec::new(),
            phase_deadline: None,
            timers: BinaryHeap::new(),
            event_tx,
            break_loop: false,
            app_info_reported: false,
            tls_info_reported: false,
        }
    }

    async fn run_loop(&mut self, mut event_rx: mpsc::Receiver<(usize, ClientEvent)>) {
        let initial = if self.config.is_rate_mode() {
            self.rate.min(self.nclients)
        } else {
            self.nclients
        };
        for _ in 0..initial {
            self.start_next_client();
        }

        let mut qps_tick =
            tokio::time::interval(Duration::from_millis(QPS_UPDATE_PERIOD_MS));
        qps_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rate_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.rate_period,
            self.config.rate_period,
        );
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.break_loop {
                break;
            }
            if self.live_clients == 0 {
                let all_started = self.started >= self.nclients;
                let drained = !self.config.is_timing_based_mode()
                    && TOTAL_REQ_LEFT.load(Ordering::Relaxed) <= 0;
                if all_started || drained {
                    break;
                }
            }

            let far = Instant::now() + Duration::from_secs(3600);
            let phase_at = self.phase_deadline.map(|(t, _)| t);
            let timer_at = self.next_timer_at();
            let rate_pending =
                self.config.is_rate_mode() && self.started < self.nclients;

            tokio::select! {
                maybe_ev = event_rx.recv() => {
                    match maybe_ev {
                        Some((idx, ev)) => self.handle_event(idx, ev),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(phase_at.unwrap_or(far))), if phase_at.is_some() => {
                    self.on_phase_fire();
                }
                _ = qps_tick.tick(), if self.qps_running => {
                    self.on_qps_refill();
                }
                _ = rate_tick.tick(), if rate_pending => {
                    let n = self.rate.min(self.nclients - self.started);
                    for _ in 0..n {
                        self.start_next_client();
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(timer_at.unwrap_or(far))), if timer_at.is_some() => {
                    self.on_client_timer();
                }
            }
        }
    }

    fn next_timer_at(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((t, _, _))| *t)
    }

    fn start_next_client(&mut self) {
        let idx = self.started;
        self.started += 1;

        let cap = (self.config.max_concurrent_streams * 2).max(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(cap);
        let mut slot = ClientSlot::new(cmd_tx);

        if !self.config.is_timing_based_mode() || self.phase == Phase::MainDuration {
            slot.cstat.record_client_start_time();
            slot.cstat.clear_connect_times();
            slot.cstat.record_connect_start_time();
        }
        self.slots.push(slot);
        self.live_clients += 1;

        if self.phase == Phase::InitialIdle {
            self.phase = Phase::WarmUp;
            self.phase_deadline = Some((
                Instant::now() + self.config.warm_up_time,
                PhaseFire::WarmupOver,
            ));
        }

        self.restart_idle_timer(idx);

        let ctx = ClientCtx {
            idx,
            config: self.config.clone(),
            tls: self.tls.clone(),
            events: self.event_tx.clone(),
            current_addr: None,
        };
        tokio::spawn(client::run_client(ctx, cmd_rx));
    }

    /// Re-run the connect sequence for a slot whose session asked for a
    /// fresh connection, reusing the address that worked before.
    fn respawn_client(&mut self, idx: usize) {
        let cap = (self.config.max_concurrent_streams * 2).max(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(cap);

        let slot = &mut self.slots[idx];
        slot.cmd_tx = cmd_tx;
        slot.connected = false;
        slot.stopping = false;
        slot.active_armed = false;

        if !self.config.is_timing_based_mode() || self.phase == Phase::MainDuration {
            slot.cstat.record_client_start_time();
            slot.cstat.clear_connect_times();
            slot.cstat.record_connect_start_time();
        }
        let current_addr = slot.current_addr;

        self.restart_idle_timer(idx);

        let ctx = ClientCtx {
            idx,
            config: self.config.clone(),
            tls: self.tls.clone(),
            events: self.event_tx.clone(),
            current_addr,
        };
        tokio::spawn(client::run_client(ctx, cmd_rx));
    }

    fn handle_event(&mut self, idx: usize, ev: ClientEvent) {
        if !self.slots[idx].alive {
            return;
        }

        // Read or write activity re-arms the inactivity timer.
        if matches!(
            ev,
            ClientEvent::Connected { .. }
                | ClientEvent::RespHeader { .. }
                | ClientEvent::RpcStatus { .. }
                | ClientEvent::StreamClosed { .. }
        ) {
            self.restart_idle_timer(idx);
        }

        match ev {
            ClientEvent::Connected {
                addr_idx,
                connect_done,
                max_streams,
                proto,
                tls,
            } => self.on_connected(idx, addr_idx, connect_done, max_streams, proto, tls),
            ClientEvent::ConnectFailed => {
                eprintln!("client could not connect to host");
                self.finish_client(idx);
            }
            ClientEvent::TlsFailed => {
                self.finish_client(idx);
            }
            ClientEvent::NegotiateFailed => {
                eprintln!("No supported protocol was negotiated. Supported protocols were:");
                for proto in &self.config.npn_list {
                    eprintln!("{proto}");
                }
                self.finish_client(idx);
            }
            ClientEvent::RespHeader {
                id,
                status,
                head_bytes,
                at,
            } => self.on_header(idx, id, status, head_bytes, at),
            ClientEvent::RpcStatus { id, code, at } => self.on_rpc_status(idx, id, code, at),
            ClientEvent::StreamClosed {
                id,
                success,
                body_bytes,
                total_bytes,
                fin,
            } => self.on_stream_close(idx, id, success, body_bytes, total_bytes, fin),
            ClientEvent::Disconnected { reconnect_hint } => {
                self.on_disconnected(idx, reconnect_hint)
            }
        }
    }

    fn on_connected(
        &mut self,
        idx: usize,
        addr_idx: Option<usize>,
        connect_done: Instant,
        max_streams: usize,
        proto: &'static str,
        tls: Option<TlsInfo>,
    ) {
        if self.id == 0 && !self.app_info_reported {
            self.app_info_reported = true;
            println!("Application protocol: {proto}");
        }
        if self.id == 0 && !self.tls_info_reported {
            if let Some(info) = &tls {
                self.tls_info_reported = true;
                println!("TLS Protocol: {}\nCipher: {}", info.version, info.cipher);
            }
        }

        let slot = &mut self.slots[idx];
        slot.connected = true;
        slot.current_addr = addr_idx;
        slot.max_streams = max_streams;
        slot.cstat.record_connect_time_at(connect_done);

        for _ in 0..max_streams {
            match self.submit_request(idx) {
                Ok(_) => {}
                Err(()) => {
                    self.process_request_failure();
                    break;
                }
            }
        }

        // Nothing was admitted and nothing ever will be: close the
        // connection instead of leaving it idle forever.
        let slot = &mut self.slots[idx];
        if slot.streams.is_empty() && TOTAL_REQ_LEFT.load(Ordering::Relaxed) <= 0 {
            self.terminate_client(idx);
        }
    }

    fn submit_request(&mut self, idx: usize) -> Result<Submit, ()> {
        if self.config.is_qps_mode() {
            if self.qps_left == 0 {
                self.blocked_on_qps.push(idx);
                return Ok(Submit::Blocked);
            }
            self.qps_left -= 1;
        } else {
            if TOTAL_REQ_LEFT.load(Ordering::Relaxed) <= 0 {
                return Err(());
            }
            // The pre-decrement value is authoritative; racing below zero
            // leaks at most threads-1 extra submissions, by design of the
            // lock-free gate.
            if TOTAL_REQ_LEFT.fetch_sub(1, Ordering::Relaxed) <= 0 {
                return Err(());
            }
        }
        TOTAL_REQ_SENT.fetch_add(1, Ordering::Relaxed);

        let in_main = self.phase == Phase::MainDuration;
        let arm_active = self.config.conn_active_timeout.is_some();

        let slot = &mut self.slots[idx];
        let id = slot.next_stream_id;
        slot.next_stream_id += 1;
        if slot.cmd_tx.try_send(ClientCmd::Submit { id }).is_err() {
            return Err(());
        }

        let mut stream = Stream::new();
        stream.stat.request_time = Some(Instant::now());
        stream.stat.request_wall_time = Some(SystemTime::now());
        slot.streams.insert(id, stream);

        if !in_main {
            return Ok(Submit::Issued);
        }

        self.stats.req_started += 1;
        self.slots[idx].req_inflight += 1;
        if arm_active && !self.slots[idx].active_armed {
            self.arm_active_timer(idx);
        }
        self.restart_idle_timer(idx);

        Ok(Submit::Issued)
    }

    fn process_request_failure(&mut self) {
        if self.phase != Phase::MainDuration {
            self.break_loop = true;
        }
    }

    fn on_header(&mut self, idx: usize, id: u64, status: u16, head_bytes: u64, at: Instant) {
        let in_main = self.phase == Phase::MainDuration;

        let Self { stats, slots, .. } = self;
        let slot = &mut slots[idx];
        slot.cstat.record_ttfb_at(at);

        let Some(stream) = slot.streams.get_mut(&id) else {
            return;
        };

        if !in_main {
            // Warm-up streams count as a success but never reach the
            // status buckets.
            stream.status_success = 1;
            return;
        }

        stats.bytes_head += head_bytes;
        stats.bytes_head_decomp += head_bytes;
        stats.bytes_total += head_bytes;

        if stream.status_success == -1 {
            stream.stat.status = status;
            if (200..300).contains(&status) {
                stats.status[2] += 1;
                stream.status_success = 1;
            } else if status < 400 {
                stats.status[3] += 1;
                stream.status_success = 1;
            } else if status < 600 {
                stats.status[(status / 100) as usize] += 1;
                stream.status_success = 0;
            } else {
                stream.status_success = 0;
            }
        }
    }

    fn on_rpc_status(&mut self, idx: usize, id: u64, code: u16, at: Instant) {
        let in_main = self.phase == Phase::MainDuration;

        let Self { stats, slots, .. } = self;
        let slot = &mut slots[idx];
        slot.cstat.record_ttfb_at(at);

        let Some(stream) = slot.streams.get_mut(&id) else {
            return;
        };

        if !in_main {
            stream.status_success = 1;
            return;
        }

        stats.bytes_total += surge_core::bolt::RESPONSE_HEADER_LEN as u64;
        stream.stat.status = code;
        stream.status_success = i8::from(code == surge_core::bolt::status::SUCCESS);
        stats.rpc_status[(code as usize).min(RPC_STATUS_SLOTS - 1)] += 1;
    }

    fn on_stream_close(
        &mut self,
        idx: usize,
        id: u64,
        success: bool,
        body_bytes: u64,
        total_bytes: u64,
        fin: bool,
    ) {
        let now = Instant::now();
        let in_main = self.phase == Phase::MainDuration;

        {
            let Self { stats, slots, .. } = self;
            let slot = &mut slots[idx];

            if in_main {
                if slot.req_inflight > 0 {
                    slot.req_inflight -= 1;
                }
                let Some(mut stream) = slot.streams.remove(&id) else {
                    return;
                };

                stats.bytes_total += total_bytes;
                stats.bytes_body += body_bytes;

                stream.stat.stream_close_time = Some(now);
                if success {
                    stream.stat.completed = true;
                    stats.req_success += 1;
                    slot.cstat.req_success += 1;
                    if stream.status_success == 1 {
                        stats.req_status_success += 1;
                    } else {
                        stats.req_failed += 1;
                    }
                    stats.req_stats.push(stream.stat);
                } else {
                    stats.req_failed += 1;
                    stats.req_error += 1;
                }
                stats.req_done += 1;

                if let Some(rtt) = stream.stat.request_duration() {
                    stats.record_rtt(rtt.as_micros() as u64);
                }
            } else {
                slot.streams.remove(&id);
            }
        }

        if TOTAL_REQ_LEFT.load(Ordering::Relaxed) <= 0 {
            self.terminate_client(idx);
            return;
        }

        if !fin {
            if self.submit_request(idx).is_err() {
                self.process_request_failure();
                // Lost the submission race and nothing is inflight here:
                // wind the connection down.
                if self.slots[idx].streams.is_empty() {
                    self.terminate_client(idx);
                }
            }
        }
    }

    fn on_disconnected(&mut self, idx: usize, reconnect_hint: bool) {
        let slot = &mut self.slots[idx];
        slot.connected = false;
        slot.cstat.record_client_end_time();
        slot.idle_deadline = None;
        slot.active_deadline = None;
        slot.active_armed = false;

        if reconnect_hint
            && !slot.stopping
            && !slot.timed_out
            && TOTAL_REQ_LEFT.load(Ordering::Relaxed) > 0
        {
            // We have no facility to restart requests already inflight on
            // the lost connection; they fail, the address is kept.
            if self.phase == Phase::MainDuration {
                self.stats.req_failed += slot.req_inflight;
                self.stats.req_error += slot.req_inflight;
            }
            self.slots[idx].req_inflight = 0;
            self.slots[idx].streams.clear();
            self.respawn_client(idx);
            return;
        }

        self.process_abandoned_streams(idx);
        self.finish_client(idx);
    }

    fn process_abandoned_streams(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if self.phase == Phase::MainDuration {
            self.stats.req_failed += slot.req_inflight;
            self.stats.req_error += slot.req_inflight;
        }
        slot.req_inflight = 0;
        slot.streams.clear();
    }

    fn terminate_client(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if !slot.stopping {
            slot.stopping = true;
            let _ = slot.cmd_tx.try_send(ClientCmd::Terminate);
        }
    }

    /// Inactivity or active-deadline expiry: charge inflight requests to
    /// the timeout counters and tear the connection down.
    fn timeout_client(&mut self, idx: usize) {
        let now = Instant::now();
        let in_main = self.phase == Phase::MainDuration;

        let Self { stats, slots, .. } = self;
        let slot = &mut slots[idx];
        slot.idle_deadline = None;
        slot.active_deadline = None;

        if in_main {
            for stream in slot.streams.values_mut() {
                if !stream.stat.completed {
                    stream.stat.stream_close_time = Some(now);
                }
            }
            stats.req_timedout += slot.req_inflight;
            stats.req_failed += slot.req_inflight;
            stats.req_error += slot.req_inflight;
        }
        slot.req_inflight = 0;
        slot.streams.clear();
        slot.timed_out = true;
        slot.stopping = true;
        let _ = slot.cmd_tx.try_send(ClientCmd::Stop);
    }

    fn finish_client(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if !slot.alive {
            return;
        }
        slot.alive = false;
        slot.connected = false;
        slot.idle_deadline = None;
        slot.active_deadline = None;
        slot.cstat.record_client_end_time();
        if !slot.stat_drained {
            slot.stat_drained = true;
            self.stats.client_stats.push(slot.cstat);
        }
        self.live_clients -= 1;
    }

    fn on_phase_fire(&mut self) {
        let Some((_, fire)) = self.phase_deadline.take() else {
            return;
        };
        match fire {
            PhaseFire::WarmupOver => {
                debug!(worker = self.id, "warm-up over, entering measurement window");
                for slot in self.slots.iter_mut().filter(|s| s.alive) {
                    slot.cstat.record_client_start_time();
                    slot.cstat.clear_connect_times();
                    slot.cstat.record_connect_start_time();
                }
                self.phase = Phase::MainDuration;
                self.phase_deadline = Some((
                    Instant::now() + self.config.duration,
                    PhaseFire::DurationOver,
                ));
                if self.config.is_qps_mode() {
                    self.qps_running = true;
                }
            }
            PhaseFire::DurationOver => {
                debug!(worker = self.id, "measurement window over");
                TOTAL_REQ_LEFT.store(0, Ordering::Relaxed);
                self.phase = Phase::DurationOver;
                self.qps_running = false;
                self.stop_all_clients();
                self.break_loop = true;
            }
        }
    }

    fn stop_all_clients(&mut self) {
        let Self { stats, slots, .. } = self;
        for slot in slots.iter_mut().filter(|s| s.alive) {
            slot.cstat.record_client_end_time();
            slot.stopping = true;
            let _ = slot.cmd_tx.try_send(ClientCmd::Stop);
            if !slot.stat_drained {
                slot.stat_drained = true;
                stats.client_stats.push(slot.cstat);
            }
        }
    }

    fn on_qps_refill(&mut self) {
        if self.qps_counts.is_empty() {
            self.qps_left = u64::MAX;
        } else {
            self.qps_left = self.qps_left.saturating_add(self.qps_counts[self.qps_idx]);
            self.qps_idx = (self.qps_idx + 1) % self.qps_counts.len();
        }

        // Drain clients parked on the token bucket, most recent first,
        // one submission each.
        while self.qps_left > 0 {
            let Some(idx) = self.blocked_on_qps.pop() else {
                break;
            };
            if !self.slots[idx].alive || !self.slots[idx].connected {
                continue;
            }
            if self.submit_request(idx).is_err() {
                self.process_request_failure();
            }
        }
    }

    fn restart_idle_timer(&mut self, idx: usize) {
        let Some(timeout) = self.config.conn_inactivity_timeout else {
            return;
        };
        let deadline = Instant::now() + timeout;
        let slot = &mut self.slots[idx];
        slot.idle_deadline = Some(deadline);
        if !slot.idle_entry_live {
            slot.idle_entry_live = true;
            self.timers
                .push(Reverse((deadline, idx, TimerKind::Inactivity)));
        }
    }

    fn arm_active_timer(&mut self, idx: usize) {
        let Some(timeout) = self.config.conn_active_timeout else {
            return;
        };
        let deadline = Instant::now() + timeout;
        let slot = &mut self.slots[idx];
        slot.active_deadline = Some(deadline);
        slot.active_armed = true;
        if !slot.active_entry_live {
            slot.active_entry_live = true;
            self.timers
                .push(Reverse((deadline, idx, TimerKind::ActiveDeadline)));
        }
    }

    fn on_client_timer(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse((at, idx, kind))) = self.timers.peek() {
            if at > now {
                break;
            }
            self.timers.pop();

            let slot = &mut self.slots[idx];
            let current = match kind {
                TimerKind::Inactivity => {
                    slot.idle_entry_live = false;
                    slot.idle_deadline
                }
                TimerKind::ActiveDeadline => {
                    slot.active_entry_live = false;
                    slot.active_deadline
                }
            };
            let Some(deadline) = current else {
                continue;
            };
            if !slot.alive || !slot.connected {
                continue;
            }
            if deadline > now {
                // Re-armed since this entry was pushed; chase the new
                // deadline.
                match kind {
                    TimerKind::Inactivity => slot.idle_entry_live = true,
                    TimerKind::ActiveDeadline => slot.active_entry_live = true,
                }
                self.timers.push(Reverse((deadline, idx, kind)));
                continue;
            }
            self.timeout_client(idx);
        }
    }
}
