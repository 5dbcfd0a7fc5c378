//! Pure logic shared by the surge load-generator binaries.
//!
//! Nothing in this crate performs I/O or owns a socket: it holds the
//! configuration model, the statistics machinery (counters, standard
//! deviation stats, latency percentiles), admission/pacing arithmetic,
//! request-line and header-set construction, and the bolt wire codec.

pub mod bolt;
pub mod config;
pub mod pacing;
pub mod request;
pub mod stats;
pub mod util;
