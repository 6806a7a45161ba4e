//! Thin CLI entry point wiring the dial pipeline together: load config,
//! open the persistent store, build an iterator, and run one or more
//! dial attempts. The pipeline's actual operation set is described in
//! `SPEC_FULL.md`; this binary is ambient plumbing around it, not a
//! feature surface (§1 Non-goals: "no UI or configuration parsing").

use burrow::app_config::AppConfig;
use burrow::dial_cache::{DialParameters, DialParametersCache};
use burrow::dialer::{self, DialConfig};
use burrow::error::DialError;
use burrow::fingerprint;
use burrow::iterator::{IteratorConfig, IteratorKind, ServerEntryIterator};
use burrow::obfuscator::PaddingRange;
use burrow::params::Publisher;
use burrow::persist::Store;
use burrow::server_list;
use burrow::store::ServerEntryStore;
use burrow::telemetry;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Path to the TOML configuration file.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Expose a Prometheus metrics endpoint at this address.
    #[clap(long, global = true)]
    metrics_addr: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Loads a hex-encoded server list into the persistent store.
    Ingest {
        #[clap(long)]
        file: PathBuf,
    },

    /// Runs the iterator once and attempts to dial the first candidate
    /// that succeeds.
    Dial {
        /// Network identifier used for affinity/replay bookkeeping.
        #[clap(long, default_value = "default")]
        network_id: String,

        #[clap(long, value_enum, default_value = "tunnel")]
        kind: IteratorKindArg,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum IteratorKindArg {
    Tactics,
    Tunnel,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => Ok(AppConfig::default()),
    };
    let config = match config.and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(addr) = &cli.metrics_addr {
        if let Err(e) = telemetry::serve(addr) {
            warn!("failed to start metrics endpoint: {e}");
        }
    }

    let store = match Store::open(std::path::Path::new(&config.storage.database_path)) {
        Ok(s) => s,
        Err(e) => {
            error!("fatal: unable to open persistent store: {e}");
            std::process::exit(1);
        }
    };
    let entry_store = ServerEntryStore::new(store.clone());
    let cache = DialParametersCache::new(store.clone(), config.storage.dial_parameters_ttl_secs);
    let publisher = Publisher::new(config.parameters.clone());

    match cli.command {
        Commands::Ingest { file } => run_ingest(&entry_store, &file),
        Commands::Dial { network_id, kind } => {
            run_dial(&entry_store, &cache, &publisher, &network_id, kind).await;
        }
    }
}

fn run_ingest(store: &ServerEntryStore, file: &PathBuf) {
    let text = match std::fs::read_to_string(file) {
        Ok(t) => t,
        Err(e) => {
            error!("failed to read server list {}: {e}", file.display());
            return;
        }
    };
    let entries = server_list::parse_list(&text);
    info!("parsed {} server entries from {}", entries.len(), file.display());
    for entry in entries {
        let outcome = store.store(&entry, false);
        info!("{}: {:?}", entry.id, outcome);
    }
}

async fn run_dial(
    store: &ServerEntryStore,
    cache: &DialParametersCache,
    publisher: &Publisher,
    network_id: &str,
    kind_arg: IteratorKindArg,
) {
    let snapshot = publisher.load();
    let kind = match kind_arg {
        IteratorKindArg::Tactics => IteratorKind::Tactics,
        IteratorKindArg::Tunnel => IteratorKind::Tunnel,
    };

    let iter_config = IteratorConfig {
        kind,
        region_constraint: None,
        replay_candidate_count: snapshot.replay_candidate_count,
        network_id: network_id.as_bytes().to_vec(),
        current_filter_fingerprint: Vec::new(),
    };
    let (mut iter, honored) = ServerEntryIterator::new(store, cache, iter_config);
    info!("affinity honored on first round: {honored}");

    while let Some(candidate) = iter.next() {
        telemetry::DIAL_ATTEMPTS.inc();
        telemetry::DIAL_IN_FLIGHT.inc();

        let Some(&port) = candidate.dial_ports.values().next() else {
            warn!("candidate {} has no dial ports configured", candidate.id);
            telemetry::DIAL_IN_FLIGHT.dec();
            continue;
        };
        let addr: SocketAddr = match format!("{}:{}", candidate.id, port).parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("candidate {} has an unparseable address: {e}", candidate.id);
                telemetry::DIAL_IN_FLIGHT.dec();
                continue;
            }
        };

        let profiles = fingerprint::built_in_profiles();
        let replayed = cache.replay_eligible(&candidate.id, network_id.as_bytes(), &snapshot).unwrap_or_else(|e| {
            warn!("dial parameters cache lookup failed for {}: {e}", candidate.id);
            None
        });

        let (pinned_profile, pinned_seed, explicit_sni) = match &replayed {
            Some(cached) => match profiles.iter().find(|p| p.name == cached.profile_name) {
                Some(p) => (Some(p.clone()), seed_from_stored(&cached.prng_seed), Some(cached.sni.clone())),
                None => (None, None, None), // profile dropped from the built-ins since it was cached
            },
            None => (None, None, None),
        };
        let pinned_profile = pinned_profile.or_else(|| {
            let mut rng = rand::thread_rng();
            fingerprint::select_profile(&snapshot, &profiles, &mut rng).cloned()
        });
        let explicit_sni = explicit_sni.unwrap_or_else(|| candidate.id.clone());

        let dial_config = DialConfig {
            dial_address_override: None,
            use_dial_host_as_sni: false,
            explicit_sni: Some(explicit_sni),
            legacy_pinned_cert_der: None,
            root_ca_pem: None,
            pinned_profile,
            pinned_seed,
            obfuscator_keyword: Some(candidate.obfuscation_keyword.clone().into_bytes()),
            obfuscator_padding_range: PaddingRange::new(16, 4096).expect("static bounds are valid"),
            deadline: snapshot.dial_timeout,
        };

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let result = dialer::dial(addr, dial_config, |a| tokio::net::TcpStream::connect(a), cancel_rx).await;

        telemetry::DIAL_IN_FLIGHT.dec();
        match result {
            Ok(conn) => {
                telemetry::DIAL_SUCCESSES.inc();
                info!("dial to {} succeeded", candidate.id);

                let used = conn.used_dial_parameters();
                let params = DialParameters {
                    profile_name: used.profile_name.clone(),
                    prng_seed: used.prng_seed.to_vec(),
                    sni: used.sni.clone(),
                    obfuscator_padding_prng_seed: used.obfuscator_padding_prng_seed.clone(),
                    timestamp_unix: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
                    ttl_secs: cache.default_ttl_secs(),
                };
                if let Err(e) = cache.set(&candidate.id, network_id.as_bytes(), &params) {
                    warn!("failed to record dial parameters for {}: {e}", candidate.id);
                }
                return;
            }
            Err(e) => {
                telemetry::record_failure(&e);
                warn!("dial to {} failed: {e}", candidate.id);
                if matches!(e, DialError::Canceled) {
                    return;
                }
            }
        }
    }
    warn!("iterator exhausted without a successful dial");
}

/// A cached seed is stored generically as `Vec<u8>` (§4.6); a record
/// that isn't exactly 32 bytes (e.g. hand-written in a test fixture)
/// can't be replayed as a profile seed and is treated as absent.
fn seed_from_stored(seed: &[u8]) -> Option<[u8; 32]> {
    <[u8; 32]>::try_from(seed).ok()
}
