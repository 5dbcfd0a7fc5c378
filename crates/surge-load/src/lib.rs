//! The surge load-generation engine.
//!
//! One OS thread per worker, each running a single-threaded tokio runtime.
//! A worker owns its clients and statistics; clients own their sockets
//! through connection tasks that talk back to the worker loop over a
//! channel. The only cross-thread state is the pair of atomic request
//! gates and the immutable `Config`.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use surge_core::config::{Config, QPS_UPDATES_PER_SECOND};
use surge_core::pacing;
use surge_core::stats::Stats;

pub mod cli;
pub mod client;
pub mod report;
pub mod session;
pub mod tls;
pub mod worker;

pub use report::Summary;

/// Run a complete benchmark: spawn the workers behind a startup barrier,
/// join them, and aggregate their statistics.
pub fn run(config: Config) -> Result<Summary> {
    let config = Arc::new(config);

    worker::init_request_gates(&config);

    let tls_config = if config.is_tls() {
        Some(Arc::new(
            tls::build_client_config(&config.npn_list).context("TLS initialization failed")?,
        ))
    } else {
        None
    };

    let nthreads = config.nthreads;
    // All workers block here until the main thread releases them, so the
    // loops start within the same few microseconds.
    let barrier = Arc::new(Barrier::new(nthreads + 1));
    let mut rng = SmallRng::from_entropy();

    let mut handles = Vec::with_capacity(nthreads);
    for i in 0..nthreads {
        let nclients =
            pacing::split_share(config.nclients as u64, nthreads as u64, i as u64) as usize;
        let rate = pacing::split_share(config.rate as u64, nthreads as u64, i as u64) as usize;
        let qps_counts = if config.is_qps_mode() {
            let share = pacing::split_share(config.qps, nthreads as u64, i as u64);
            pacing::qps_slots(share, QPS_UPDATES_PER_SECOND, &mut rng)
        } else {
            Vec::new()
        };

        let seed = worker::WorkerSeed {
            id: i,
            config: config.clone(),
            tls: tls_config.clone(),
            nclients,
            rate,
            qps_counts,
        };
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || -> Result<Stats> {
            barrier.wait();
            worker::Worker::run(seed)
        }));
    }

    barrier.wait();
    let start = Instant::now();

    let mut stats = Stats::default();
    for handle in handles {
        let worker_stats = handle
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
        stats.merge_from(worker_stats);
    }
    let wall = start.elapsed();

    Ok(report::aggregate(&config, stats, wall))
}
