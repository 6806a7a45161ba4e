//! End-to-end scenarios for the dial/tunnel establishment pipeline
//! (store + iterator + dial-parameter cache), matching the six named
//! scenarios.

use burrow::dial_cache::{DialParameters, DialParametersCache};
use burrow::iterator::{IteratorConfig, IteratorKind, ServerEntryIterator};
use burrow::persist::Store;
use burrow::store::{ServerEntry, ServerEntryStore};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Initialized once for the whole test binary rather than per-test, the
/// way a shared temp store directory would be.
static LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

fn fixtures() -> (tempfile::TempDir, ServerEntryStore, DialParametersCache) {
    Lazy::force(&LOGGING);
    let dir = tempfile::tempdir().unwrap();
    let persist = Store::open(&dir.path().join("pipeline.redb")).unwrap();
    let store = ServerEntryStore::new(persist.clone());
    let cache = DialParametersCache::new(persist, 3600);
    (dir, store, cache)
}

fn entry(id: &str, region: &str) -> ServerEntry {
    ServerEntry {
        id: id.to_string(),
        region: region.to_string(),
        capabilities: vec!["tunnel".to_string()],
        dial_ports: HashMap::from([("tunnel".to_string(), 443)]),
        inner_channel_host_key: vec![1, 2, 3],
        obfuscation_keyword: "kw".to_string(),
        front_hops: vec![],
        configuration_version: 1,
    }
}

fn cfg(network_id: &str, filter: &str) -> IteratorConfig {
    IteratorConfig {
        kind: IteratorKind::Tunnel,
        region_constraint: None,
        replay_candidate_count: 1,
        network_id: network_id.as_bytes().to_vec(),
        current_filter_fingerprint: filter.as_bytes().to_vec(),
    }
}

#[test]
fn scenario_1_fresh_dial_no_affinity_yields_all_entries_in_some_order() {
    let (_dir, store, cache) = fixtures();
    for id in ["A", "B", "C"] {
        store.store(&entry(id, "us"), false);
    }
    let (mut it, honored) = ServerEntryIterator::new(&store, &cache, cfg("net0", "F1"));
    assert!(!honored);
    let mut seen = Vec::new();
    while let Some(e) = it.next() {
        seen.push(e.id);
    }
    seen.sort();
    assert_eq!(seen, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

#[test]
fn scenario_2_affinity_honored_when_filter_matches() {
    let (_dir, store, cache) = fixtures();
    for id in ["A", "B", "C"] {
        store.store(&entry(id, "us"), false);
    }
    store.promote("A", b"F1").unwrap();

    let (mut it, honored) = ServerEntryIterator::new(&store, &cache, cfg("net0", "F1"));
    assert!(honored);
    assert_eq!(it.next().unwrap().id, "A");
}

#[test]
fn scenario_3_affinity_broken_by_filter_change() {
    let (_dir, store, cache) = fixtures();
    for id in ["A", "B", "C"] {
        store.store(&entry(id, "us"), false);
    }
    store.promote("A", b"F1").unwrap();

    let (_it, honored) = ServerEntryIterator::new(&store, &cache, cfg("net0", "F2"));
    assert!(!honored);
}

#[test]
fn scenario_4_replay_candidates_precede_non_replay_candidates() {
    let (_dir, store, cache) = fixtures();
    store.store(&entry("A", "us"), false);
    store.store(&entry("B", "us"), false);

    let params = DialParameters {
        profile_name: "chrome_120".to_string(),
        prng_seed: vec![0; 16],
        sni: "example.com".to_string(),
        obfuscator_padding_prng_seed: vec![0; 16],
        timestamp_unix: 1_700_000_000,
        ttl_secs: 3600,
    };
    cache.set("A", b"net0", &params).unwrap();

    let (mut it, _) = ServerEntryIterator::new(&store, &cache, cfg("net0", "nomatch"));
    assert_eq!(it.next().unwrap().id, "A");
    assert_eq!(it.next().unwrap().id, "B");
}

#[test]
fn scenario_5_obfuscator_handshake_produces_matching_keystreams() {
    use burrow::obfuscator::{build_seed_message, parse_seed_message, PaddingRange};

    let seed = [11u8; 16];
    let keyword = b"server-keyword";
    let padding = vec![42u8; 100];
    let (msg, mut client_state) = build_seed_message(&seed, keyword, &padding);

    let range = PaddingRange::new(16, 8192).unwrap();
    let (mut server_state, consumed) = parse_seed_message(&msg, keyword, &range).unwrap();
    assert_eq!(consumed, msg.len());
    assert_eq!(client_state.padding_prng_seed, server_state.padding_prng_seed);

    let mut from_client = b"request over the tunnel".to_vec();
    let mut as_seen_by_server = from_client.clone();
    client_state.obfuscate_client_to_server(&mut from_client);
    server_state.obfuscate_client_to_server(&mut as_seen_by_server);
    assert_eq!(from_client, as_seen_by_server);
}
