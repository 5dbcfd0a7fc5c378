use rand::Rng;

/// Split `total` across `parts` workers, giving the first `total % parts`
/// workers one extra. Used for clients, connection rate and QPS shares.
pub fn split_share(total: u64, parts: u64, idx: u64) -> u64 {
    debug_assert!(parts > 0);
    total / parts + u64::from(idx < total % parts)
}

/// Distribute a worker's per-second QPS budget across refill slots.
///
/// Tokens land on uniformly random slots rather than being spread evenly,
/// so the sub-second burst pattern is stochastic. An empty slot vector
/// means the refill is unbounded.
pub fn qps_slots<R: Rng>(per_second: u64, nslots: usize, rng: &mut R) -> Vec<u64> {
    let mut slots = vec![0u64; nslots];
    for _ in 0..per_second {
        let i = rng.gen_range(0..nslots);
        slots[i] += 1;
    }
    slots
}
