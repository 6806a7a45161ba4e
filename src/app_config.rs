//! Unified configuration loader (§A.3): a TOML document merged onto
//! defaults, then validated, generalizing the nested-`Option`-section
//! pattern this crate has always used for its configuration.

use crate::error::DialError;
use crate::params::{RawSnapshot, Snapshot};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
struct RawRoot {
    parameters: Option<RawSnapshot>,
    storage: Option<RawStorage>,
    tls: Option<RawTls>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorage {
    database_path: Option<String>,
    dial_parameters_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTls {
    root_ca_pem_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: String,
    pub dial_parameters_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: "burrow.redb".to_string(),
            dial_parameters_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub root_ca_pem_path: Option<String>,
}

/// Aggregated, validated configuration for the whole dial pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub parameters: Snapshot,
    pub storage: StorageConfig,
    pub tls: TlsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            parameters: Snapshot::default(),
            storage: StorageConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parses a TOML document. Unknown top-level keys and unknown keys
    /// within known sections are ignored by serde's default behavior;
    /// out-of-range values are clamped, not rejected, by
    /// [`RawSnapshot::clamp_into`].
    pub fn from_toml(s: &str) -> Result<Self, DialError> {
        let raw: RawRoot = toml::from_str(s).map_err(|e| DialError::configuration(e.to_string()))?;
        let base = AppConfig::default();

        let parameters = raw.parameters.unwrap_or_default().clamp_into(&base.parameters);

        let storage = raw
            .storage
            .map(|r| StorageConfig {
                database_path: r.database_path.unwrap_or_else(|| base.storage.database_path.clone()),
                dial_parameters_ttl_secs: r.dial_parameters_ttl_secs.unwrap_or(base.storage.dial_parameters_ttl_secs),
            })
            .unwrap_or(base.storage);

        let tls = raw
            .tls
            .map(|r| TlsConfig {
                root_ca_pem_path: r.root_ca_pem_path,
            })
            .unwrap_or_default();

        Ok(AppConfig { parameters, storage, tls })
    }

    pub fn from_file(path: &Path) -> Result<Self, DialError> {
        let contents = std::fs::read_to_string(path).map_err(|e| DialError::configuration(e.to_string()))?;
        Self::from_toml(&contents)
    }

    /// Checked separately from parsing so a caller can load, mutate, then
    /// validate a config built programmatically too.
    pub fn validate(&self) -> Result<(), DialError> {
        if self.storage.database_path.trim().is_empty() {
            return Err(DialError::configuration("storage.database_path must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored_not_rejected() {
        let toml = r#"
            [parameters]
            replay_candidate_count = 2
            totally_unknown_key = "ignored"

            [totally_unknown_section]
            x = 1
        "#;
        let cfg = AppConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.parameters.replay_candidate_count, 2);
    }

    #[test]
    fn out_of_range_replay_count_is_clamped_not_rejected() {
        let toml = r#"
            [parameters]
            replay_candidate_count = -3
        "#;
        let cfg = AppConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.parameters.replay_candidate_count, 0);
    }

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert_eq!(cfg.storage.database_path, StorageConfig::default().database_path);
    }
}
