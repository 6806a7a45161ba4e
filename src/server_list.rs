//! Server list ingestion (§6): parses the inbound stream of
//! hex-encoded server-list entries into [`ServerEntry`] values ready
//! for [`crate::store::ServerEntryStore::store`].
//!
//! Out of scope beyond parsing: how the stream itself is fetched or
//! authenticated is an external collaborator (§1).

use crate::store::ServerEntry;
use serde::Deserialize;
use std::collections::HashMap;

/// The `jsonBody` portion of one entry, carrying the full capability
/// set, key material, and ports.
#[derive(Debug, Deserialize)]
struct EntryBody {
    region: String,
    capabilities: Vec<String>,
    dial_ports: HashMap<String, u16>,
    obfuscation_keyword: String,
    #[serde(default)]
    front_hops: Vec<String>,
    configuration_version: u64,
}

/// Parses one hex-encoded line in the format
/// `ipAddress SP webPort SP secret SP pemBody SP jsonBody`.
/// Malformed entries and entries with empty required fields are
/// rejected (`None`), never panicking.
pub fn parse_entry(hex_line: &str) -> Option<ServerEntry> {
    let decoded = hex::decode(hex_line.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let mut parts = text.splitn(5, ' ');

    let ip = parts.next()?.to_string();
    let _web_port = parts.next()?;
    let _secret = parts.next()?;
    let pem_body = parts.next()?;
    let json_body = parts.next()?;

    if ip.is_empty() || pem_body.is_empty() || json_body.is_empty() {
        return None;
    }

    let body: EntryBody = serde_json::from_str(json_body).ok()?;
    if body.region.is_empty() || body.capabilities.is_empty() || body.obfuscation_keyword.is_empty() {
        return None;
    }

    Some(ServerEntry {
        id: ip,
        region: body.region,
        capabilities: body.capabilities,
        dial_ports: body.dial_ports,
        inner_channel_host_key: pem_body.as_bytes().to_vec(),
        obfuscation_keyword: body.obfuscation_keyword,
        front_hops: body.front_hops,
        configuration_version: body.configuration_version,
    })
}

/// Parses every line of a server list, skipping (not failing on) any
/// malformed line.
pub fn parse_list(text: &str) -> Vec<ServerEntry> {
    text.lines().filter(|l| !l.trim().is_empty()).filter_map(parse_entry).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_entry(ip: &str, region: &str) -> String {
        let json = format!(
            r#"{{"region":"{region}","capabilities":["tunnel"],"dial_ports":{{"tunnel":443}},"obfuscation_keyword":"kw","front_hops":[],"configuration_version":1}}"#
        );
        let line = format!("{ip} 443 secretvalue pembodyvalue {json}");
        hex::encode(line)
    }

    #[test]
    fn parses_a_well_formed_entry() {
        let line = encode_entry("1.2.3.4", "us");
        let entry = parse_entry(&line).unwrap();
        assert_eq!(entry.id, "1.2.3.4");
        assert_eq!(entry.region, "us");
        assert_eq!(entry.configuration_version, 1);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(parse_entry("not-hex!!").is_none());
    }

    #[test]
    fn rejects_empty_required_fields() {
        let line = hex::encode("  443 secret pembody {}");
        assert!(parse_entry(&line).is_none());
    }

    #[test]
    fn parse_list_skips_bad_lines_and_keeps_good_ones() {
        let good = encode_entry("5.6.7.8", "eu");
        let text = format!("garbage-not-hex\n{good}\n");
        let entries = parse_list(&text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "5.6.7.8");
    }
}
