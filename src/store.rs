//! Server-Entry Store (§4.1): a durable keyed record of known servers.
//!
//! Backed by [`crate::persist::Store`]. All mutations are transactional
//! and durable; `scan` runs against a single read-transaction snapshot so
//! a concurrent writer can never hand a visitor a mix of old and new
//! rows.

use crate::error::DialError;
use crate::persist::{Store as Persist, KV_KEY_AFFINITY_ID, KV_KEY_FILTER_FINGERPRINT, TABLE_KV, TABLE_SERVER_ENTRIES};
use log::warn;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One remote endpoint and its supported capabilities (§3 "Server Entry").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub region: String,
    pub capabilities: Vec<String>,
    pub dial_ports: HashMap<String, u16>,
    pub inner_channel_host_key: Vec<u8>,
    pub obfuscation_keyword: String,
    pub front_hops: Vec<String>,
    pub configuration_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Skipped,
    Failed,
}

#[derive(Clone)]
pub struct ServerEntryStore {
    persist: Persist,
}

impl ServerEntryStore {
    pub fn new(persist: Persist) -> Self {
        ServerEntryStore { persist }
    }

    /// Insert-or-replace per §4.1's store policy: insert if absent;
    /// otherwise replace iff `replace_if_exists` or the incoming
    /// configuration version is strictly greater than the stored one.
    /// Malformed stored data counts as replaceable, not as a failure.
    pub fn store(&self, entry: &ServerEntry, replace_if_exists: bool) -> StoreOutcome {
        let existing = match self.persist.get(TABLE_SERVER_ENTRIES, &entry.id) {
            Ok(v) => v,
            Err(_) => return StoreOutcome::Failed,
        };

        let should_write = match existing {
            None => true,
            Some(bytes) => match serde_json::from_slice::<ServerEntry>(&bytes) {
                Ok(stored) => replace_if_exists || entry.configuration_version > stored.configuration_version,
                Err(_) => true, // malformed stored data is treated as replaceable
            },
        };

        if !should_write {
            return StoreOutcome::Skipped;
        }

        let encoded = match serde_json::to_vec(entry) {
            Ok(v) => v,
            Err(_) => return StoreOutcome::Failed,
        };
        match self.persist.put(TABLE_SERVER_ENTRIES, &entry.id, &encoded) {
            Ok(()) => StoreOutcome::Stored,
            Err(_) => StoreOutcome::Failed,
        }
    }

    /// Walk every entry in a single snapshot. Malformed rows are logged
    /// and skipped, never passed to the visitor.
    pub fn scan(&self, mut visitor: impl FnMut(&ServerEntry)) -> Result<(), DialError> {
        let txn = self
            .persist
            .database()
            .begin_read()
            .map_err(|e| DialError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE_SERVER_ENTRIES)?;
        for row in table.iter()? {
            let (_, v) = row.map_err(|e| DialError::storage(e.to_string()))?;
            match serde_json::from_slice::<ServerEntry>(v.value()) {
                Ok(entry) => visitor(&entry),
                Err(e) => warn!("skipping malformed server entry: {e}"),
            }
        }
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<Option<ServerEntry>, DialError> {
        match self.persist.get(TABLE_SERVER_ENTRIES, id)? {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice::<ServerEntry>(&bytes) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!("dropping malformed server entry {id}: {e}");
                    Ok(None)
                }
            },
        }
    }

    /// Atomically sets the affinity identifier and the filter fingerprint
    /// bound to it. Does not verify the id exists here; [`lookup_affinity`]
    /// does that check at read time (a stale id is ignored, not errored).
    pub fn promote(&self, id: &str, current_filter: &[u8]) -> Result<(), DialError> {
        self.persist.put(TABLE_KV, KV_KEY_AFFINITY_ID, id.as_bytes())?;
        self.persist.put(TABLE_KV, KV_KEY_FILTER_FINGERPRINT, current_filter)?;
        Ok(())
    }

    /// Returns `(affinity entry, honored)` where `honored` is true iff a
    /// previous promote was recorded and its filter fingerprint
    /// byte-equals `current_filter` (§4.2).
    pub fn affinity(&self, current_filter: &[u8]) -> Result<(Option<ServerEntry>, bool), DialError> {
        let id = match self.persist.get(TABLE_KV, KV_KEY_AFFINITY_ID)? {
            Some(v) => v,
            None => return Ok((None, false)),
        };
        let id = String::from_utf8_lossy(&id).to_string();
        let stored_filter = self.persist.get(TABLE_KV, KV_KEY_FILTER_FINGERPRINT)?.unwrap_or_default();
        let honored = stored_filter == current_filter;
        if !honored {
            return Ok((None, false));
        }
        // A stale affinity id (entry since deleted) is ignored, not errored.
        let entry = self.lookup(&id)?;
        let honored = honored && entry.is_some();
        Ok((entry, honored))
    }

    pub fn clear_all(&self) -> Result<(), DialError> {
        let txn = self.persist.database().begin_write()?;
        {
            let mut t = txn.open_table(TABLE_SERVER_ENTRIES)?;
            let keys: Vec<String> = t.iter()?.filter_map(|r| r.ok()).map(|(k, _)| k.value().to_string()).collect();
            for k in keys {
                t.remove(k.as_str())?;
            }
        }
        txn.commit()?;
        self.persist.delete(TABLE_KV, KV_KEY_AFFINITY_ID).ok();
        self.persist.delete(TABLE_KV, KV_KEY_FILTER_FINGERPRINT).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, version: u64) -> ServerEntry {
        ServerEntry {
            id: id.to_string(),
            region: "us".to_string(),
            capabilities: vec!["tunnel".to_string()],
            dial_ports: HashMap::new(),
            inner_channel_host_key: vec![1, 2, 3],
            obfuscation_keyword: "kw".to_string(),
            front_hops: Vec::new(),
            configuration_version: version,
        }
    }

    fn store() -> (tempfile::TempDir, ServerEntryStore) {
        let dir = tempfile::tempdir().unwrap();
        let persist = Persist::open(&dir.path().join("s.redb")).unwrap();
        (dir, ServerEntryStore::new(persist))
    }

    #[test]
    fn insert_when_absent() {
        let (_dir, s) = store();
        assert_eq!(s.store(&entry("A", 1), false), StoreOutcome::Stored);
        assert_eq!(s.lookup("A").unwrap().unwrap().configuration_version, 1);
    }

    #[test]
    fn replace_only_if_newer_version_or_forced() {
        let (_dir, s) = store();
        s.store(&entry("A", 5), false);
        assert_eq!(s.store(&entry("A", 3), false), StoreOutcome::Skipped);
        assert_eq!(s.lookup("A").unwrap().unwrap().configuration_version, 5);
        assert_eq!(s.store(&entry("A", 3), true), StoreOutcome::Stored);
        assert_eq!(s.lookup("A").unwrap().unwrap().configuration_version, 3);
        assert_eq!(s.store(&entry("A", 9), false), StoreOutcome::Stored);
        assert_eq!(s.lookup("A").unwrap().unwrap().configuration_version, 9);
    }

    #[test]
    fn configuration_version_invariant_holds() {
        let (_dir, s) = store();
        s.store(&entry("A", 2), false);
        let prev = s.lookup("A").unwrap().unwrap().configuration_version;
        s.store(&entry("A", 7), false);
        let now = s.lookup("A").unwrap().unwrap().configuration_version;
        assert_eq!(now, prev.max(7));
    }

    #[test]
    fn affinity_honored_iff_filter_matches() {
        let (_dir, s) = store();
        s.store(&entry("A", 1), false);
        s.promote("A", b"F1").unwrap();
        let (e, honored) = s.affinity(b"F1").unwrap();
        assert!(honored);
        assert_eq!(e.unwrap().id, "A");

        let (e2, honored2) = s.affinity(b"F2").unwrap();
        assert!(!honored2);
        assert!(e2.is_none());
    }

    #[test]
    fn stale_affinity_id_is_ignored_not_errored() {
        let (_dir, s) = store();
        s.store(&entry("A", 1), false);
        s.promote("A", b"F1").unwrap();
        s.clear_all().unwrap();
        let (e, honored) = s.affinity(b"F1").unwrap();
        assert!(e.is_none());
        assert!(!honored);
    }

    #[test]
    fn scan_visits_every_entry_in_one_snapshot() {
        let (_dir, s) = store();
        s.store(&entry("A", 1), false);
        s.store(&entry("B", 1), false);
        let mut seen = Vec::new();
        s.scan(|e| seen.push(e.id.clone())).unwrap();
        seen.sort();
        assert_eq!(seen, vec!["A".to_string(), "B".to_string()]);
    }
}
