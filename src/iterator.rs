//! Server-Entry Iterator (§4.2): produces dial candidates in rank order
//! — affinity first, then replay-capable, then shuffled residual — and
//! re-filters by region/protocol as it goes.

use crate::dial_cache::DialParametersCache;
use crate::store::{ServerEntry, ServerEntryStore};
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Which kind of attempt this iterator is feeding: a lighter "tactics"
/// handshake, or a full tunnel dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorKind {
    Tactics,
    Tunnel,
}

pub struct IteratorConfig {
    pub kind: IteratorKind,
    pub region_constraint: Option<String>,
    pub replay_candidate_count: usize,
    pub network_id: Vec<u8>,
    pub current_filter_fingerprint: Vec<u8>,
}

/// Per-iterator ordering state (§3 "Candidate Order State").
pub struct ServerEntryIterator<'a> {
    store: &'a ServerEntryStore,
    cache: &'a DialParametersCache,
    config: IteratorConfig,
    order: Vec<String>,
    cursor: usize,
    affinity_honored: bool,
    rng: StdRng,
}

impl<'a> ServerEntryIterator<'a> {
    /// Construction yields the iterator and whether affinity should be
    /// honored on the first round.
    pub fn new(store: &'a ServerEntryStore, cache: &'a DialParametersCache, config: IteratorConfig) -> (Self, bool) {
        let mut it = ServerEntryIterator {
            store,
            cache,
            config,
            order: Vec::new(),
            cursor: 0,
            affinity_honored: false,
            rng: StdRng::from_entropy(),
        };
        it.reset();
        let honored = it.affinity_honored;
        (it, honored)
    }

    #[cfg(test)]
    fn new_with_rng(store: &'a ServerEntryStore, cache: &'a DialParametersCache, config: IteratorConfig, rng: StdRng) -> Self {
        let mut it = ServerEntryIterator {
            store,
            cache,
            config,
            order: Vec::new(),
            cursor: 0,
            affinity_honored: false,
            rng,
        };
        it.reset();
        it
    }

    /// Rebuilds the ordered list without closing the store (§4.2):
    /// affinity (if honored) occupies slot 0; the rest is collected in
    /// storage order, uniformly shuffled, then replay-capable candidates
    /// are partitioned to the front of the shuffled region.
    pub fn reset(&mut self) {
        let mut all_ids = Vec::new();
        if let Err(e) = self.store.scan(|entry| all_ids.push(entry.id.clone())) {
            warn!("server entry scan failed while resetting iterator: {e}");
        }

        let (affinity_entry, honored) = match self.store.affinity(&self.config.current_filter_fingerprint) {
            Ok(v) => v,
            Err(e) => {
                warn!("affinity lookup failed: {e}");
                (None, false)
            }
        };
        self.affinity_honored = honored;

        let affinity_id = affinity_entry.map(|e| e.id);
        let mut residual: Vec<String> = all_ids
            .into_iter()
            .filter(|id| affinity_id.as_deref() != Some(id.as_str()))
            .collect();

        residual.shuffle(&mut self.rng);

        if self.config.replay_candidate_count > 0 {
            partition_replay_capable_to_front(&mut residual, |id| self.has_live_dial_parameters(id));
        }

        let mut order = Vec::with_capacity(residual.len() + 1);
        if let Some(id) = affinity_id {
            order.push(id);
        }
        order.extend(residual);

        self.order = order;
        self.cursor = 0;
    }

    fn has_live_dial_parameters(&self, server_id: &str) -> bool {
        self.cache
            .get(server_id, &self.config.network_id)
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Advances the cursor, applying in-iterator filters. Malformed
    /// entries are logged and skipped, never fatal.
    pub fn next(&mut self) -> Option<ServerEntry> {
        while self.cursor < self.order.len() {
            let id = self.order[self.cursor].clone();
            self.cursor += 1;

            let entry = match self.store.lookup(&id) {
                Ok(Some(e)) => e,
                Ok(None) => continue,
                Err(e) => {
                    warn!("skipping entry {id}: lookup failed: {e}");
                    continue;
                }
            };

            if !self.passes_filters(&entry) {
                continue;
            }
            return Some(entry);
        }
        None
    }

    fn passes_filters(&self, entry: &ServerEntry) -> bool {
        match self.config.kind {
            IteratorKind::Tactics => entry.capabilities.iter().any(|c| c == "tactics"),
            IteratorKind::Tunnel => match &self.config.region_constraint {
                None => true,
                Some(region) => &entry.region == region,
            },
        }
    }
}

/// Two-pointer in-place partition: ids for which `is_replay_capable`
/// holds move to the front, preserving the relative (already-shuffled)
/// order within each partition.
fn partition_replay_capable_to_front(ids: &mut [String], is_replay_capable: impl Fn(&str) -> bool) {
    let mut write = 0;
    for read in 0..ids.len() {
        if is_replay_capable(&ids[read]) {
            ids.swap(write, read);
            write += 1;
        }
    }
}

/// A fixed-size variant that bypasses the store entirely and yields one
/// inlined entry exactly once.
pub struct FixedTargetIterator {
    entry: Option<ServerEntry>,
}

impl FixedTargetIterator {
    pub fn new(entry: ServerEntry) -> Self {
        FixedTargetIterator { entry: Some(entry) }
    }

    pub fn next(&mut self) -> Option<ServerEntry> {
        self.entry.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::Store as Persist;
    use std::collections::HashMap;

    fn entry(id: &str, region: &str, caps: &[&str]) -> ServerEntry {
        ServerEntry {
            id: id.to_string(),
            region: region.to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            dial_ports: HashMap::new(),
            inner_channel_host_key: vec![],
            obfuscation_keyword: "kw".to_string(),
            front_hops: vec![],
            configuration_version: 1,
        }
    }

    fn fixtures() -> (tempfile::TempDir, ServerEntryStore, DialParametersCache) {
        let dir = tempfile::tempdir().unwrap();
        let persist = Persist::open(&dir.path().join("s.redb")).unwrap();
        let store = ServerEntryStore::new(persist.clone());
        let cache = DialParametersCache::new(persist, 3600);
        (dir, store, cache)
    }

    fn cfg() -> IteratorConfig {
        IteratorConfig {
            kind: IteratorKind::Tunnel,
            region_constraint: None,
            replay_candidate_count: 1,
            network_id: b"net0".to_vec(),
            current_filter_fingerprint: b"F1".to_vec(),
        }
    }

    #[test]
    fn full_cycle_visits_each_entry_once_and_reset_repeats_it() {
        let (_dir, store, cache) = fixtures();
        store.store(&entry("A", "us", &["tunnel"]), false);
        store.store(&entry("B", "us", &["tunnel"]), false);
        store.store(&entry("C", "us", &["tunnel"]), false);

        let (mut it, _) = ServerEntryIterator::new(&store, &cache, cfg());
        let mut seen = Vec::new();
        while let Some(e) = it.next() {
            seen.push(e.id);
        }
        seen.sort();
        assert_eq!(seen, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        assert!(it.next().is_none());

        it.reset();
        let mut seen2 = Vec::new();
        while let Some(e) = it.next() {
            seen2.push(e.id);
        }
        seen2.sort();
        assert_eq!(seen2, seen);
    }

    #[test]
    fn affinity_occupies_slot_zero_when_honored() {
        let (_dir, store, cache) = fixtures();
        store.store(&entry("A", "us", &["tunnel"]), false);
        store.store(&entry("B", "us", &["tunnel"]), false);
        store.store(&entry("C", "us", &["tunnel"]), false);
        store.promote("A", b"F1").unwrap();

        let (mut it, honored) = ServerEntryIterator::new(&store, &cache, cfg());
        assert!(honored);
        assert_eq!(it.next().unwrap().id, "A");
    }

    #[test]
    fn affinity_ignored_when_filter_fingerprint_differs() {
        let (_dir, store, cache) = fixtures();
        store.store(&entry("A", "us", &["tunnel"]), false);
        store.promote("A", b"F1").unwrap();

        let mut c = cfg();
        c.current_filter_fingerprint = b"F2".to_vec();
        let (_it, honored) = ServerEntryIterator::new(&store, &cache, c);
        assert!(!honored);
    }

    #[test]
    fn replay_capable_entries_precede_others_in_first_round() {
        let (_dir, store, cache) = fixtures();
        store.store(&entry("A", "us", &["tunnel"]), false);
        store.store(&entry("B", "us", &["tunnel"]), false);

        let params = crate::dial_cache::DialParameters {
            profile_name: "chrome_120".to_string(),
            prng_seed: vec![0; 16],
            sni: "example.com".to_string(),
            obfuscator_padding_prng_seed: vec![0; 16],
            timestamp_unix: 1000,
            ttl_secs: 3600,
        };
        cache.set("A", b"net0", &params).unwrap();

        let (mut it, _) = ServerEntryIterator::new(&store, &cache, cfg());
        let first = it.next().unwrap();
        let second = it.next().unwrap();
        assert_eq!(first.id, "A");
        assert_eq!(second.id, "B");
    }

    #[test]
    fn tactics_iterator_requires_tactics_capability() {
        let (_dir, store, cache) = fixtures();
        store.store(&entry("A", "us", &["tunnel"]), false);
        store.store(&entry("B", "us", &["tactics"]), false);

        let mut c = cfg();
        c.kind = IteratorKind::Tactics;
        let (mut it, _) = ServerEntryIterator::new(&store, &cache, c);
        let only = it.next().unwrap();
        assert_eq!(only.id, "B");
        assert!(it.next().is_none());
    }

    #[test]
    fn shuffle_over_many_trials_is_not_always_the_same_order() {
        let (_dir, store, cache) = fixtures();
        for id in ["A", "B", "C", "D", "E"] {
            store.store(&entry(id, "us", &["tunnel"]), false);
        }
        let mut first_slot_counts: HashMap<String, u32> = HashMap::new();
        for seed in 0u64..50 {
            let mut c = cfg();
            c.current_filter_fingerprint = b"nomatch".to_vec();
            let it = ServerEntryIterator::new_with_rng(&store, &cache, c, StdRng::seed_from_u64(seed));
            let first_id = it.order.first().cloned().unwrap_or_default();
            *first_slot_counts.entry(first_id).or_insert(0) += 1;
        }
        // With 50 independent shuffles over 5 entries, no single entry
        // should have monopolized slot 0.
        assert!(first_slot_counts.len() > 1);
    }

    #[test]
    fn fixed_target_iterator_yields_its_entry_exactly_once() {
        let mut it = FixedTargetIterator::new(entry("X", "us", &["tunnel"]));
        assert_eq!(it.next().unwrap().id, "X");
        assert!(it.next().is_none());
    }
}
