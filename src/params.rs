//! Parameter Snapshot: an atomically readable bundle of client-tunable
//! knobs, published by copy-on-publish rather than mutated in place.
//!
//! A task takes one [`Snapshot`] at the start of an attempt and uses it
//! for the whole attempt. Values that cross-validate against each other
//! (e.g. min/max timeouts) are only ever compared within one snapshot,
//! never across a hot reload — see `DESIGN.md` and spec §9 ("cyclic
//! parameter lookups").

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// One immutable publication of the tunable knobs. Cheap to clone (it's
/// an `Arc` underneath `Publisher`); never mutated after construction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub profile_whitelist: Vec<String>,
    pub limit_tunnel_protocols: Vec<String>,
    pub replay_candidate_count: usize,
    pub liveness_test_byte_threshold: u32,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub rate_limit_bytes_per_sec: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            profile_whitelist: Vec::new(),
            limit_tunnel_protocols: Vec::new(),
            replay_candidate_count: 1,
            liveness_test_byte_threshold: 0,
            dial_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(120),
            rate_limit_bytes_per_sec: 0,
        }
    }
}

impl Snapshot {
    /// A profile is eligible if the whitelist is empty (unconstrained) or
    /// contains the name.
    pub fn allows_profile(&self, name: &str) -> bool {
        self.profile_whitelist.is_empty()
            || self.profile_whitelist.iter().any(|p| p == name)
    }
}

/// Raw, possibly-partial knobs as they appear in a TOML document. Every
/// field is optional so a config file only needs to name what it wants
/// to override; unknown keys under `[parameters]` are ignored by serde's
/// default behavior and out-of-range values are clamped in
/// [`RawSnapshot::clamp_into`], not rejected.
#[derive(Debug, Default, Deserialize)]
pub struct RawSnapshot {
    pub profile_whitelist: Option<Vec<String>>,
    pub limit_tunnel_protocols: Option<Vec<String>>,
    pub replay_candidate_count: Option<i64>,
    pub liveness_test_byte_threshold: Option<u32>,
    pub dial_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub rate_limit_bytes_per_sec: Option<u64>,
}

impl RawSnapshot {
    pub fn clamp_into(self, base: &Snapshot) -> Snapshot {
        Snapshot {
            profile_whitelist: self.profile_whitelist.unwrap_or_else(|| base.profile_whitelist.clone()),
            limit_tunnel_protocols: self
                .limit_tunnel_protocols
                .unwrap_or_else(|| base.limit_tunnel_protocols.clone()),
            replay_candidate_count: self
                .replay_candidate_count
                .map(|v| v.max(0) as usize)
                .unwrap_or(base.replay_candidate_count),
            liveness_test_byte_threshold: self
                .liveness_test_byte_threshold
                .unwrap_or(base.liveness_test_byte_threshold),
            dial_timeout: self
                .dial_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.dial_timeout),
            idle_timeout: self
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.idle_timeout),
            rate_limit_bytes_per_sec: self
                .rate_limit_bytes_per_sec
                .unwrap_or(base.rate_limit_bytes_per_sec),
        }
    }
}

/// Publishes [`Snapshot`] values via an atomic pointer swap. Readers call
/// [`Publisher::load`] and hold the returned `Arc` for the duration of
/// their attempt; a concurrent `publish` never mutates what they're
/// holding.
pub struct Publisher {
    current: ArcSwap<Snapshot>,
}

impl Publisher {
    pub fn new(initial: Snapshot) -> Self {
        Publisher {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, next: Snapshot) {
        self.current.store(Arc::new(next));
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Publisher::new(Snapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_profile_unconstrained_when_whitelist_empty() {
        let snap = Snapshot::default();
        assert!(snap.allows_profile("chrome_120"));
    }

    #[test]
    fn allows_profile_respects_whitelist() {
        let mut snap = Snapshot::default();
        snap.profile_whitelist = vec!["chrome_120".to_string()];
        assert!(snap.allows_profile("chrome_120"));
        assert!(!snap.allows_profile("firefox_115"));
    }

    #[test]
    fn publisher_readers_see_whole_snapshots_never_a_mix() {
        let pub_ = Publisher::new(Snapshot::default());
        let held = pub_.load();
        let mut next = Snapshot::default();
        next.replay_candidate_count = 7;
        pub_.publish(next);
        // the reference taken before publish still observes the old value
        assert_eq!(held.replay_candidate_count, 1);
        assert_eq!(pub_.load().replay_candidate_count, 7);
    }

    #[test]
    fn raw_snapshot_clamps_negative_replay_count_to_zero() {
        let base = Snapshot::default();
        let raw = RawSnapshot {
            replay_candidate_count: Some(-5),
            ..Default::default()
        };
        let merged = raw.clamp_into(&base);
        assert_eq!(merged.replay_candidate_count, 0);
    }
}
