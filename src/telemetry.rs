//! Telemetry metrics for the dial/tunnel establishment pipeline.
//!
//! Currently exported metrics:
//! - `dial_attempts_total`: Number of dial attempts started.
//! - `dial_successes_total`: Number of attempts that completed a
//!   verified handshake.
//! - `dial_failures_total{kind}`: Attempts that ended in each
//!   `DialError` kind.
//! - `obfuscator_seed_rejections_total`: Seed messages rejected for
//!   magic mismatch or an out-of-range padding length.
//! - `dial_cache_hits_total` / `dial_cache_misses_total`: Replay
//!   eligibility outcomes.
//! - `dial_in_flight`: Attempts currently running, bounded by the
//!   worker pool size.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref DIAL_ATTEMPTS: IntCounter =
        register_int_counter!("dial_attempts_total", "Total dial attempts started").unwrap();
    pub static ref DIAL_SUCCESSES: IntCounter =
        register_int_counter!("dial_successes_total", "Total verified handshakes").unwrap();
    pub static ref DIAL_FAILURES: IntCounterVec = register_int_counter_vec!(
        "dial_failures_total",
        "Dial attempts that ended in each error kind",
        &["kind"]
    )
    .unwrap();
    pub static ref OBFUSCATOR_SEED_REJECTIONS: IntCounter = register_int_counter!(
        "obfuscator_seed_rejections_total",
        "Seed messages rejected for bad magic or padding length"
    )
    .unwrap();
    pub static ref DIAL_CACHE_HITS: IntCounter =
        register_int_counter!("dial_cache_hits_total", "Replay-eligible cache lookups").unwrap();
    pub static ref DIAL_CACHE_MISSES: IntCounter =
        register_int_counter!("dial_cache_misses_total", "Replay-ineligible or absent cache lookups").unwrap();
    pub static ref DIAL_IN_FLIGHT: IntGauge =
        register_int_gauge!("dial_in_flight", "Dial attempts currently running").unwrap();
}

/// Records the outcome of one attempt against the `DialError` variant
/// name, matching `error.rs`'s six kinds.
pub fn record_failure(error: &crate::error::DialError) {
    let kind = match error {
        crate::error::DialError::Configuration(_) => "configuration",
        crate::error::DialError::Transport(_) => "transport",
        crate::error::DialError::Handshake(_) => "handshake",
        crate::error::DialError::Verification(_) => "verification",
        crate::error::DialError::Canceled => "canceled",
        crate::error::DialError::Storage(_) => "storage",
    };
    DIAL_FAILURES.with_label_values(&[kind]).inc();
}

pub fn serve(addr: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = TcpListener::bind(addr)?;
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming() {
            if let Ok(mut s) = stream {
                let metrics = prometheus::gather();
                let mut buf = Vec::new();
                encoder.encode(&metrics, &mut buf).unwrap();
                let _ = s.write_all(&buf);
            }
        }
    });
    Ok(())
}

pub fn flush() {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metrics, &mut buf).is_ok() {
        log::info!("\n{}", String::from_utf8_lossy(&buf));
    }
}
