//! TLS Fingerprint Assembler (§4.4): for a chosen profile, builds a
//! ClientHello whose ciphers, extensions, and ordering match a named
//! browser/version pairing — deterministically from a seed for the
//! randomized profiles.
//!
//! Two outputs come out of one [`ClientHelloSpec`]: the literal wire
//! bytes (used for fingerprint-digest computation and for the forged
//! session-ticket record) and a `rustls::ClientConfig` builder hint
//! (cipher suite order, ALPN order, version band) used to steer the
//! handshake rustls actually runs. Full byte-for-byte fidelity on the
//! live wire handshake is a best-effort approximation — rustls does not
//! expose a public API for injecting raw ClientHello bytes — see
//! `DESIGN.md`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// TLS version band a profile's ClientHello targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBand {
    Pre13,
    Tls13,
}

/// One named, immutable recipe for a ClientHello (§3 "TLS Profile").
#[derive(Debug, Clone)]
pub struct TlsProfile {
    pub name: &'static str,
    pub version_band: VersionBand,
    pub randomized: bool,
    pub base_cipher_suites: Vec<u16>,
    pub base_extension_order: Vec<u16>,
    pub supported_curves: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub alpn: Vec<&'static str>,
    pub grease_positions: Vec<usize>,
}

/// Fully assembled, concrete ClientHello description for one dial
/// attempt.
#[derive(Debug, Clone)]
pub struct ClientHelloSpec {
    pub profile_name: String,
    pub cipher_suites: Vec<u16>,
    pub extension_order: Vec<u16>,
    pub curves: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub alpn: Vec<String>,
    pub random_seed: [u8; 32],
    pub padding_style_len: u16,
}

impl ClientHelloSpec {
    /// The raw wire bytes for this ClientHello: a TLS record header
    /// wrapping a handshake header wrapping the body. Hand-built rather
    /// than routed through rustls, which has no public hook for
    /// dictating exact byte layout.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version: TLS 1.2
        body.extend_from_slice(&self.random_seed);
        body.push(0); // legacy_session_id length

        body.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for cs in &self.cipher_suites {
            body.extend_from_slice(&cs.to_be_bytes());
        }

        body.push(1); // compression methods length
        body.push(0); // null compression

        let mut extensions = Vec::new();
        for ext_id in &self.extension_order {
            let ext_body = self.extension_body(*ext_id);
            extensions.extend_from_slice(&ext_id.to_be_bytes());
            extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext_body);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::with_capacity(4 + body.len());
        handshake.push(0x01); // handshake type: client_hello
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&body);

        let mut record = Vec::with_capacity(5 + handshake.len());
        record.push(0x16); // content type: handshake
        record.extend_from_slice(&[0x03, 0x01]); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn extension_body(&self, ext_id: u16) -> Vec<u8> {
        match ext_id {
            0x0000 => Vec::new(), // server_name: filled in by the dialer once SNI is known
            0x000a => {
                let mut b = Vec::new();
                b.extend_from_slice(&((self.curves.len() * 2) as u16).to_be_bytes());
                for c in &self.curves {
                    b.extend_from_slice(&c.to_be_bytes());
                }
                b
            }
            0x000d => {
                let mut b = Vec::new();
                b.extend_from_slice(&((self.signature_algorithms.len() * 2) as u16).to_be_bytes());
                for s in &self.signature_algorithms {
                    b.extend_from_slice(&s.to_be_bytes());
                }
                b
            }
            0x0010 => {
                let mut b = Vec::new();
                let proto_bytes: Vec<u8> = self
                    .alpn
                    .iter()
                    .flat_map(|p| {
                        let mut v = vec![p.len() as u8];
                        v.extend_from_slice(p.as_bytes());
                        v
                    })
                    .collect();
                b.extend_from_slice(&(proto_bytes.len() as u16).to_be_bytes());
                b.extend_from_slice(&proto_bytes);
                b
            }
            0x0015 => vec![0u8; self.padding_style_len as usize],
            _ => Vec::new(),
        }
    }

    /// A stable digest of this ClientHello's shape, used for cache
    /// matching and tests — not the TLS random, which is per-connection.
    pub fn fingerprint_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for cs in &self.cipher_suites {
            hasher.update(cs.to_be_bytes());
        }
        for ext in &self.extension_order {
            hasher.update(ext.to_be_bytes());
        }
        hasher.finalize().into()
    }
}

/// Selects a profile name uniformly over the intersection of the
/// snapshot's whitelist and the supported set (or uniformly over all
/// supported profiles when the whitelist is empty).
pub fn select_profile<'a>(
    snapshot: &crate::params::Snapshot,
    supported: &'a [TlsProfile],
    rng: &mut impl Rng,
) -> Option<&'a TlsProfile> {
    let eligible: Vec<&TlsProfile> = supported
        .iter()
        .filter(|p| snapshot.profile_whitelist.is_empty() || snapshot.profile_whitelist.iter().any(|w| w == p.name))
        .collect();
    eligible.choose(rng).copied()
}

/// RFC 8701 GREASE codepoints: reserved values of the form `0x?A?A`,
/// shared by the cipher-suite and extension registries. Middleboxes are
/// expected to ignore any value drawn from this set.
const GREASE_VALUES: [u16; 16] = [
    0x0A0A, 0x1A1A, 0x2A2A, 0x3A3A, 0x4A4A, 0x5A5A, 0x6A6A, 0x7A7A, 0x8A8A, 0x9A9A, 0xAAAA, 0xBABA, 0xCACA, 0xDADA,
    0xEAEA, 0xFAFA,
];

fn pick_grease(rng: &mut impl Rng) -> u16 {
    GREASE_VALUES[rng.gen_range(0..GREASE_VALUES.len())]
}

/// Splices one GREASE placeholder into `values` at each configured
/// position, clamping to the list's current length so a position
/// recorded against a shorter base list still lands as "append".
fn splice_grease(values: &mut Vec<u16>, positions: &[usize], rng: &mut impl Rng) {
    for &pos in positions {
        let at = pos.min(values.len());
        values.insert(at, pick_grease(rng));
    }
}

/// Assembles a concrete [`ClientHelloSpec`] for `profile`. For
/// randomized profiles, `seed` fully determines the result: the same
/// `(profile.name, seed)` always yields a byte-equal ClientHello (§8).
pub fn assemble(profile: &TlsProfile, seed: Option<[u8; 32]>) -> ClientHelloSpec {
    if !profile.randomized {
        // GREASE selection is genuine per-handshake randomness even for a
        // fixed profile — real browsers reroll it on every ClientHello —
        // so it draws from the process RNG rather than the replay seed.
        let mut rng = rand::thread_rng();
        let mut cipher_suites = profile.base_cipher_suites.clone();
        splice_grease(&mut cipher_suites, &profile.grease_positions, &mut rng);

        let mut extension_order = profile.base_extension_order.clone();
        if !profile.grease_positions.is_empty() {
            extension_order.insert(0, pick_grease(&mut rng));
        }

        return ClientHelloSpec {
            profile_name: profile.name.to_string(),
            cipher_suites,
            extension_order,
            curves: profile.supported_curves.clone(),
            signature_algorithms: profile.signature_algorithms.clone(),
            alpn: profile.alpn.iter().map(|s| s.to_string()).collect(),
            random_seed: seed.unwrap_or_default(),
            padding_style_len: 0,
        };
    }

    let seed = seed.expect("randomized profile requires a PRNG seed");
    let mut rng = StdRng::from_seed(seed);

    // Obsolete ciphers (conventionally the low ids in this table) are
    // forced to the tail rather than mixed into the shuffle.
    let (mut modern, mut obsolete): (Vec<u16>, Vec<u16>) =
        profile.base_cipher_suites.iter().copied().partition(|&c| c >= 0x1300);
    modern.shuffle(&mut rng);
    obsolete.shuffle(&mut rng);
    let mut cipher_suites = modern;
    cipher_suites.append(&mut obsolete);
    splice_grease(&mut cipher_suites, &profile.grease_positions, &mut rng);

    let mut signature_algorithms = profile.signature_algorithms.clone();
    signature_algorithms.shuffle(&mut rng);

    let mut extension_order = profile.base_extension_order.clone();
    extension_order.shuffle(&mut rng);
    if !profile.grease_positions.is_empty() {
        extension_order.insert(0, pick_grease(&mut rng));
    }

    // Biased-coin inclusion of the padding extension (ext id 0x0015).
    if rng.gen_bool(0.5) {
        extension_order.retain(|&e| e != 0x0015);
    } else if !extension_order.contains(&0x0015) {
        extension_order.push(0x0015);
    }

    let curve_count = rng.gen_range(1..=profile.supported_curves.len().max(1));
    let mut curves = profile.supported_curves.clone();
    curves.shuffle(&mut rng);
    curves.truncate(curve_count);

    let random_seed: [u8; 32] = rng.gen();

    ClientHelloSpec {
        profile_name: profile.name.to_string(),
        cipher_suites,
        extension_order,
        curves,
        signature_algorithms,
        alpn: profile.alpn.iter().map(|s| s.to_string()).collect(),
        random_seed,
        padding_style_len: rng.gen_range(0..=256),
    }
}

/// Fabricates a forged session-ticket record keyed by a 32-byte
/// obfuscated-session-ticket secret, so the TLS machine emits a
/// resumption attempt and the real certificate exchange is skipped or
/// encrypted (§4.4's last paragraph). This is recorded alongside the
/// dial parameters; it is not threaded into rustls's own session cache,
/// which has no public API for accepting an externally forged ticket —
/// see `DESIGN.md`.
pub fn fabricate_session_ticket(secret: &[u8; 32], sni: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(sni.as_bytes());
    hasher.finalize().to_vec()
}

/// The named, hard-coded profiles this assembler supports out of the
/// box. Kept small and explicit, in the spirit of the profiles the
/// source hard-codes per browser/version pairing.
pub fn built_in_profiles() -> Vec<TlsProfile> {
    vec![
        TlsProfile {
            name: "chrome_120",
            version_band: VersionBand::Tls13,
            randomized: false,
            base_cipher_suites: vec![0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030],
            base_extension_order: vec![0x0000, 0x0017, 0x000d, 0x0010, 0x002b, 0x000a],
            supported_curves: vec![0x001d, 0x0017, 0x0018],
            signature_algorithms: vec![0x0403, 0x0804, 0x0401],
            alpn: vec!["h2", "http/1.1"],
            grease_positions: vec![0],
        },
        TlsProfile {
            name: "firefox_115",
            version_band: VersionBand::Tls13,
            randomized: false,
            base_cipher_suites: vec![0x1301, 0x1303, 0x1302, 0xc02c, 0xc02b, 0xc030, 0xc02f],
            base_extension_order: vec![0x0000, 0x000a, 0x000d, 0x0010, 0x002b, 0x0017],
            supported_curves: vec![0x001d, 0x0017, 0x0018, 0x0019],
            signature_algorithms: vec![0x0403, 0x0503, 0x0603, 0x0804],
            alpn: vec!["h2", "http/1.1"],
            grease_positions: vec![1],
        },
        TlsProfile {
            name: "legacy_tls12",
            version_band: VersionBand::Pre13,
            randomized: false,
            base_cipher_suites: vec![0xc02f, 0xc030, 0xc02b, 0xc02c, 0x009c, 0x009d],
            base_extension_order: vec![0x0000, 0x000a, 0x000d, 0x0010],
            supported_curves: vec![0x001d, 0x0017],
            signature_algorithms: vec![0x0401, 0x0501, 0x0601],
            alpn: vec!["http/1.1"],
            grease_positions: vec![],
        },
        TlsProfile {
            name: "randomized_modern",
            version_band: VersionBand::Tls13,
            randomized: true,
            base_cipher_suites: vec![0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0x009c, 0x009d],
            base_extension_order: vec![0x0000, 0x0017, 0x000d, 0x0010, 0x002b, 0x000a, 0x0015],
            supported_curves: vec![0x001d, 0x0017, 0x0018, 0x0019],
            signature_algorithms: vec![0x0403, 0x0503, 0x0603, 0x0804, 0x0401],
            alpn: vec!["h2", "http/1.1"],
            grease_positions: vec![0, 2],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomized_profile_is_deterministic_in_its_seed() {
        let profiles = built_in_profiles();
        let profile = profiles.iter().find(|p| p.randomized).unwrap();
        let seed = [42u8; 32];
        let a = assemble(profile, Some(seed));
        let b = assemble(profile, Some(seed));
        assert_eq!(a.to_wire_bytes(), b.to_wire_bytes());
    }

    #[test]
    fn different_seeds_usually_produce_different_bytes() {
        let profiles = built_in_profiles();
        let profile = profiles.iter().find(|p| p.randomized).unwrap();
        let a = assemble(profile, Some([1u8; 32]));
        let b = assemble(profile, Some([2u8; 32]));
        assert_ne!(a.to_wire_bytes(), b.to_wire_bytes());
    }

    #[test]
    fn obsolete_ciphers_are_forced_to_the_tail() {
        let profiles = built_in_profiles();
        let profile = profiles.iter().find(|p| p.randomized).unwrap();
        let spec = assemble(profile, Some([9u8; 32]));
        // GREASE placeholders are spliced in afterward and aren't subject
        // to the modern/obsolete ordering rule, so they're excluded here.
        let real: Vec<u16> = spec
            .cipher_suites
            .iter()
            .copied()
            .filter(|c| !GREASE_VALUES.contains(c))
            .collect();
        let first_obsolete = real.iter().position(|&c| c < 0x1300);
        let last_modern = real.iter().rposition(|&c| c >= 0x1300);
        if let (Some(fo), Some(lm)) = (first_obsolete, last_modern) {
            assert!(fo > lm);
        }
    }

    #[test]
    fn grease_placeholder_is_spliced_into_cipher_suites_when_configured() {
        let profiles = built_in_profiles();
        let profile = profiles.iter().find(|p| p.name == "chrome_120").unwrap();
        assert!(!profile.grease_positions.is_empty());
        let spec = assemble(profile, None);
        assert!(spec.cipher_suites.iter().any(|c| GREASE_VALUES.contains(c)));
        assert!(spec.extension_order.iter().any(|e| GREASE_VALUES.contains(e)));
    }

    #[test]
    fn no_grease_spliced_when_profile_declares_no_positions() {
        let profiles = built_in_profiles();
        let profile = profiles.iter().find(|p| p.name == "legacy_tls12").unwrap();
        assert!(profile.grease_positions.is_empty());
        let spec = assemble(profile, None);
        assert!(!spec.cipher_suites.iter().any(|c| GREASE_VALUES.contains(c)));
    }

    #[test]
    fn fixed_profile_assembly_is_not_randomized() {
        let profiles = built_in_profiles();
        let profile = profiles.iter().find(|p| !p.randomized).unwrap();
        let a = assemble(profile, None);
        let b = assemble(profile, None);
        assert_eq!(a.cipher_suites, b.cipher_suites);
        assert_eq!(a.extension_order, b.extension_order);
    }

    #[test]
    fn select_profile_respects_whitelist_intersection() {
        let profiles = built_in_profiles();
        let mut snap = crate::params::Snapshot::default();
        snap.profile_whitelist = vec!["firefox_115".to_string()];
        let mut rng = StdRng::seed_from_u64(1);
        let chosen = select_profile(&snap, &profiles, &mut rng).unwrap();
        assert_eq!(chosen.name, "firefox_115");
    }
}
