//! The persistent bucket store backing §6 of the spec: a single keyed
//! database file holding server entries, dial parameters, split-tunnel
//! route ETags, URL ETags, a general key/value bucket, per-kind stat
//! records, SLOKs, tactics, and speed-test samples.
//!
//! Built on `redb`, an embedded, pure-Rust, transactional key/value
//! store — durability and snapshot reads come from redb directly rather
//! than anything hand-rolled here.

use crate::error::DialError;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

pub const TABLE_SERVER_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("server_entries");
pub const TABLE_DIAL_PARAMETERS: TableDefinition<&str, &[u8]> = TableDefinition::new("dial_parameters");
pub const TABLE_ROUTE_ETAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("route_etags");
pub const TABLE_URL_ETAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("url_etags");
pub const TABLE_KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
pub const TABLE_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");
pub const TABLE_SLOKS: TableDefinition<&str, &[u8]> = TableDefinition::new("sloks");
pub const TABLE_TACTICS: TableDefinition<&str, &[u8]> = TableDefinition::new("tactics");
pub const TABLE_SPEED_TEST_SAMPLES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("speed_test_samples");

/// Reserved keys inside [`TABLE_KV`].
pub const KV_KEY_AFFINITY_ID: &str = "__affinity_id";
pub const KV_KEY_FILTER_FINGERPRINT: &str = "__filter_fingerprint";

/// One-byte state flag persisted alongside each stat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatState {
    Unreported = 0,
    Reporting = 1,
}

impl StatState {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => StatState::Reporting,
            _ => StatState::Unreported,
        }
    }
}

/// Handle to the on-disk bucket store. Cheap to clone; `redb::Database`
/// serializes its own writers internally so this is safe to share across
/// tasks the way the spec's shared server-entry store is (§5).
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, ensures every
    /// named bucket exists, and reverts any stat record left in the
    /// `Reporting` state back to `Unreported` — the previous process
    /// cannot attest that reporting succeeded (§6).
    pub fn open(path: &Path) -> Result<Self, DialError> {
        let db = Database::create(path).map_err(|e| DialError::storage(e.to_string()))?;
        {
            let txn = db.begin_write()?;
            {
                txn.open_table(TABLE_SERVER_ENTRIES)?;
                txn.open_table(TABLE_DIAL_PARAMETERS)?;
                txn.open_table(TABLE_ROUTE_ETAGS)?;
                txn.open_table(TABLE_URL_ETAGS)?;
                txn.open_table(TABLE_KV)?;
                txn.open_table(TABLE_STATS)?;
                txn.open_table(TABLE_SLOKS)?;
                txn.open_table(TABLE_TACTICS)?;
                txn.open_table(TABLE_SPEED_TEST_SAMPLES)?;
            }
            txn.commit()?;
        }
        let store = Store { db: Arc::new(db) };
        store.revert_reporting_stats()?;
        Ok(store)
    }

    fn revert_reporting_stats(&self) -> Result<(), DialError> {
        let txn = self.db.begin_write()?;
        let mut to_revert = Vec::new();
        {
            let table = txn.open_table(TABLE_STATS)?;
            for row in table.iter()? {
                let (k, v) = row.map_err(|e| DialError::storage(e.to_string()))?;
                let bytes = v.value();
                if let Some(&flag) = bytes.last() {
                    if StatState::from_byte(flag) == StatState::Reporting {
                        to_revert.push((k.value().to_string(), bytes[..bytes.len() - 1].to_vec()));
                    }
                }
            }
        }
        if !to_revert.is_empty() {
            let mut table = txn.open_table(TABLE_STATS)?;
            for (key, mut body) in to_revert {
                body.push(StatState::Unreported as u8);
                table.insert(key.as_str(), body.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn get(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>, DialError> {
        let txn = self.db.begin_read().map_err(|e| DialError::storage(e.to_string()))?;
        let t = txn.open_table(table)?;
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    pub fn put(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> Result<(), DialError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table)?;
            t.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<(), DialError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table)?;
            t.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporting_stat_reverts_to_unreported_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = Store::open(&path).unwrap();
            let txn = store.database().begin_write().unwrap();
            {
                let mut t = txn.open_table(TABLE_STATS).unwrap();
                let mut body = b"payload".to_vec();
                body.push(StatState::Reporting as u8);
                t.insert("stat1", body.as_slice()).unwrap();
            }
            txn.commit().unwrap();
        }
        // Reopen: the revert pass should flip the flag back.
        let store = Store::open(&path).unwrap();
        let raw = store.get(TABLE_STATS, "stat1").unwrap().unwrap();
        assert_eq!(*raw.last().unwrap(), StatState::Unreported as u8);
        assert_eq!(&raw[..raw.len() - 1], b"payload");
    }

    #[test]
    fn kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("store.redb")).unwrap();
        store.put(TABLE_KV, KV_KEY_AFFINITY_ID, b"1.2.3.4").unwrap();
        assert_eq!(store.get(TABLE_KV, KV_KEY_AFFINITY_ID).unwrap().unwrap(), b"1.2.3.4");
        store.delete(TABLE_KV, KV_KEY_AFFINITY_ID).unwrap();
        assert!(store.get(TABLE_KV, KV_KEY_AFFINITY_ID).unwrap().is_none());
    }
}
