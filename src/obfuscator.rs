//! Obfuscator (§4.3): a seed-message key exchange followed by
//! stream-cipher framing with length padding.
//!
//! Uses RC4 for wire compatibility, per the source's own choice — see
//! `DESIGN.md` for the malleability limitation this carries and why no
//! silent substitute cipher is used here.

use crate::error::DialError;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use std::io;

pub const SEED_LENGTH: usize = 16;
pub const MAGIC_VALUE: u32 = 0x3AD1B387;
pub const KEY_DERIVATION_ITERATIONS: u32 = 6000;
pub const MAX_PADDING_LENGTH: usize = 8192;

const DIRECTION_CLIENT_TO_SERVER: &[u8] = b"client_to_server";
const DIRECTION_SERVER_TO_CLIENT: &[u8] = b"server_to_client";

/// Bounds on padding length, validated at construction (§4.3, §8).
#[derive(Debug, Clone, Copy)]
pub struct PaddingRange {
    pub min: usize,
    pub max: usize,
}

impl PaddingRange {
    /// Rejects ranges where `min < SEED_LENGTH`, `max > MAX_PADDING_LENGTH`,
    /// or `min > max`.
    pub fn new(min: usize, max: usize) -> Result<Self, DialError> {
        if min < SEED_LENGTH {
            return Err(DialError::configuration(format!(
                "padding minimum {min} is below the seed length {SEED_LENGTH}"
            )));
        }
        if max > MAX_PADDING_LENGTH {
            return Err(DialError::configuration(format!(
                "padding maximum {max} exceeds the protocol maximum {MAX_PADDING_LENGTH}"
            )));
        }
        if min > max {
            return Err(DialError::configuration(format!("padding minimum {min} exceeds maximum {max}")));
        }
        Ok(PaddingRange { min, max })
    }
}

/// Derives the 16-byte RC4 key for one direction: SHA-1(seed ‖ keyword ‖
/// directionTag), re-hashed `KEY_DERIVATION_ITERATIONS` times, first 16
/// bytes of the final digest.
fn derive_key(seed: &[u8], keyword: &[u8], direction_tag: &[u8]) -> [u8; 16] {
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(keyword);
    hasher.update(direction_tag);
    let mut digest = hasher.finalize();

    for _ in 1..KEY_DERIVATION_ITERATIONS {
        let mut hasher = Sha1::new();
        hasher.update(digest);
        digest = hasher.finalize();
    }

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Live obfuscator state for one connection: a pair of independently
/// keyed RC4 ciphers plus the padding PRNG seed extracted from the
/// client's padding.
pub struct ObfuscatorState {
    client_to_server: Rc4<rc4::consts::U16>,
    server_to_client: Rc4<rc4::consts::U16>,
    pub padding_prng_seed: Vec<u8>,
}

impl ObfuscatorState {
    pub fn derive(seed: &[u8; SEED_LENGTH], keyword: &[u8]) -> Self {
        let c2s_key = derive_key(seed, keyword, DIRECTION_CLIENT_TO_SERVER);
        let s2c_key = derive_key(seed, keyword, DIRECTION_SERVER_TO_CLIENT);
        ObfuscatorState {
            client_to_server: Rc4::new(&c2s_key.into()),
            server_to_client: Rc4::new(&s2c_key.into()),
            padding_prng_seed: Vec::new(),
        }
    }

    pub fn obfuscate_client_to_server(&mut self, buf: &mut [u8]) {
        self.client_to_server.apply_keystream(buf);
    }

    pub fn obfuscate_server_to_client(&mut self, buf: &mut [u8]) {
        self.server_to_client.apply_keystream(buf);
    }
}

/// Builds the client's seed message: 16 random plaintext seed bytes,
/// then magic/length/padding encrypted with the derived
/// client-to-server cipher.
pub fn build_seed_message(seed: &[u8; SEED_LENGTH], keyword: &[u8], padding: &[u8]) -> (Vec<u8>, ObfuscatorState) {
    let mut state = ObfuscatorState::derive(seed, keyword);

    let mut msg = Vec::with_capacity(SEED_LENGTH + 4 + 4 + padding.len());
    msg.extend_from_slice(seed);

    let mut encrypted = Vec::with_capacity(8 + padding.len());
    encrypted.extend_from_slice(&MAGIC_VALUE.to_be_bytes());
    encrypted.extend_from_slice(&(padding.len() as u32).to_be_bytes());
    encrypted.extend_from_slice(padding);
    state.obfuscate_client_to_server(&mut encrypted);

    msg.extend_from_slice(&encrypted);

    let seed_prefix_len = padding.len().min(SEED_LENGTH);
    state.padding_prng_seed = padding[..seed_prefix_len].to_vec();

    (msg, state)
}

/// Server-side seed message parser. Validates magic **before** length —
/// load-bearing against a chosen-ciphertext oracle (§4.3): accepting
/// length before magic would let an attacker probe padding bounds
/// byte-by-byte.
pub fn parse_seed_message(data: &[u8], keyword: &[u8], padding_range: &PaddingRange) -> Result<(ObfuscatorState, usize), DialError> {
    if data.len() < SEED_LENGTH + 8 {
        return Err(DialError::handshake("seed message shorter than the minimum header"));
    }

    let mut seed = [0u8; SEED_LENGTH];
    seed.copy_from_slice(&data[..SEED_LENGTH]);

    let mut state = ObfuscatorState::derive(&seed, keyword);

    let mut header = data[SEED_LENGTH..SEED_LENGTH + 8].to_vec();
    state.obfuscate_client_to_server(&mut header);

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC_VALUE {
        return Err(DialError::handshake("seed message magic mismatch"));
    }

    let padding_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if padding_len < padding_range.min || padding_len > padding_range.max {
        return Err(DialError::handshake(format!(
            "padding length {padding_len} outside configured range [{}, {}]",
            padding_range.min, padding_range.max
        )));
    }

    let total_needed = SEED_LENGTH + 8 + padding_len;
    if data.len() < total_needed {
        return Err(DialError::handshake("seed message truncated before declared padding end"));
    }

    let mut padding = data[SEED_LENGTH + 8..total_needed].to_vec();
    state.obfuscate_client_to_server(&mut padding);

    let seed_prefix_len = padding.len().min(SEED_LENGTH);
    state.padding_prng_seed = padding[..seed_prefix_len].to_vec();

    Ok((state, total_needed))
}

/// Reads exactly one seed message off an async byte stream, growing the
/// buffer as the declared length demands. Kept separate from
/// [`parse_seed_message`] so the pure parsing logic stays testable
/// without I/O.
pub async fn read_seed_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
    keyword: &[u8],
    padding_range: &PaddingRange,
) -> Result<ObfuscatorState, DialError> {
    let mut header = [0u8; SEED_LENGTH + 8];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| io_to_dial_error(e))?;

    let mut seed = [0u8; SEED_LENGTH];
    seed.copy_from_slice(&header[..SEED_LENGTH]);
    let mut state = ObfuscatorState::derive(&seed, keyword);

    let mut tail = header[SEED_LENGTH..].to_vec();
    state.obfuscate_client_to_server(&mut tail);
    let magic = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if magic != MAGIC_VALUE {
        return Err(DialError::handshake("seed message magic mismatch"));
    }
    let padding_len = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]) as usize;
    if padding_len < padding_range.min || padding_len > padding_range.max {
        return Err(DialError::handshake(format!(
            "padding length {padding_len} outside configured range [{}, {}]",
            padding_range.min, padding_range.max
        )));
    }

    let mut padding = vec![0u8; padding_len];
    reader.read_exact(&mut padding).await.map_err(io_to_dial_error)?;
    state.obfuscate_client_to_server(&mut padding);

    let seed_prefix_len = padding.len().min(SEED_LENGTH);
    state.padding_prng_seed = padding[..seed_prefix_len].to_vec();

    Ok(state)
}

fn io_to_dial_error(e: io::Error) -> DialError {
    DialError::Transport(e)
}
