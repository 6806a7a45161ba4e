//! Dial Parameters Cache (§4.6): keyed by (server IP, network id),
//! records the exact fingerprint/seed/SNI used on the last successful
//! dial so a later attempt may replay it.
//!
//! Grounded on the same shape of problem as a TLS fingerprint cache
//! keyed by target and scored for reuse — writes are transactional,
//! reads are snapshot, same as every other bucket in
//! [`crate::persist`].

use crate::error::DialError;
use crate::params::Snapshot;
use crate::persist::{Store as Persist, TABLE_DIAL_PARAMETERS};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// §3 "Dial Parameters".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialParameters {
    pub profile_name: String,
    pub prng_seed: Vec<u8>,
    pub sni: String,
    pub obfuscator_padding_prng_seed: Vec<u8>,
    pub timestamp_unix: u64,
    pub ttl_secs: u64,
}

impl DialParameters {
    fn is_within_ttl(&self, now_unix: u64) -> bool {
        now_unix.saturating_sub(self.timestamp_unix) <= self.ttl_secs
    }
}

pub struct DialParametersCache {
    persist: Persist,
    default_ttl_secs: u64,
}

fn cache_key(server_id: &str, network_id: &[u8]) -> String {
    // ipAddress ‖ networkId, hex-encoded so it is representable as a redb
    // string key.
    let mut buf = server_id.as_bytes().to_vec();
    buf.extend_from_slice(network_id);
    hex::encode(buf)
}

impl DialParametersCache {
    pub fn new(persist: Persist, default_ttl_secs: u64) -> Self {
        DialParametersCache { persist, default_ttl_secs }
    }

    pub fn get(&self, server_id: &str, network_id: &[u8]) -> Result<Option<DialParameters>, DialError> {
        let key = cache_key(server_id, network_id);
        match self.persist.get(TABLE_DIAL_PARAMETERS, &key)? {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice::<DialParameters>(&bytes) {
                Ok(params) => Ok(Some(params)),
                Err(_) => Ok(None), // corrupt record: treated as absent, not an error
            },
        }
    }

    pub fn set(&self, server_id: &str, network_id: &[u8], params: &DialParameters) -> Result<(), DialError> {
        let key = cache_key(server_id, network_id);
        let encoded = serde_json::to_vec(params).map_err(|e| DialError::storage(e.to_string()))?;
        self.persist.put(TABLE_DIAL_PARAMETERS, &key, &encoded)
    }

    pub fn delete(&self, server_id: &str, network_id: &[u8]) -> Result<(), DialError> {
        let key = cache_key(server_id, network_id);
        self.persist.delete(TABLE_DIAL_PARAMETERS, &key)
    }

    /// A record is replay-eligible when it exists, is within TTL, and its
    /// profile is still in the snapshot's whitelist. Ineligibility is
    /// silent: callers fall back to fresh parameter generation.
    pub fn replay_eligible(&self, server_id: &str, network_id: &[u8], snapshot: &Snapshot) -> Result<Option<DialParameters>, DialError> {
        let params = match self.get(server_id, network_id)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        if !params.is_within_ttl(now) {
            return Ok(None);
        }
        if !snapshot.allows_profile(&params.profile_name) {
            return Ok(None);
        }
        Ok(Some(params))
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }
}
