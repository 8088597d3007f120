//! Chunk encryption key: loading, derivation, keyed digests.
//!
//! Key file: 32 bytes as hex (64 chars) or base64, surrounding whitespace ignored.
//! With a key password the effective key is SHA-256(key || password).
//!
//! When a key is present chunk digests are HMAC-SHA256(key, data), so equal plaintext
//! under different keys never shares a chunk.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use super::hex_encode;
use crate::engine::KeyMaterial;

type HmacSha256 = Hmac<Sha256>;

const FINGERPRINT_DOMAIN: &[u8] = b"pbs-session key fingerprint v1";

pub struct ChunkKey {
    key: [u8; 32],
}

impl ChunkKey {
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Read the key file named by `material` and apply the key password.
    pub fn load(material: &KeyMaterial) -> Result<Self> {
        let mut text = std::fs::read_to_string(&material.key_file)
            .with_context(|| format!("read key file {}", material.key_file))?;
        let decoded = decode_key_text(&text);
        text.zeroize();
        let mut raw = decoded.with_context(|| format!("parse key file {}", material.key_file))?;

        let key = match material.key_password.as_deref() {
            Some(pw) => {
                let mut h = Sha256::new();
                h.update(raw);
                h.update(pw.as_bytes());
                let mut out = [0u8; 32];
                out.copy_from_slice(&h.finalize());
                out
            }
            None => raw,
        };
        raw.zeroize();
        Ok(Self { key })
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Short public identifier of the key, stored in manifests.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(FINGERPRINT_DOMAIN);
        h.update(self.key);
        let full = hex_encode(&h.finalize());
        // 8 байт достаточно для сравнения ключей
        full[..16].to_string()
    }

    pub fn digest(&self, data: &[u8]) -> Result<String> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|e| anyhow!("chunk key: {}", e))?;
        mac.update(data);
        Ok(hex_encode(&mac.finalize().into_bytes()))
    }
}

impl Drop for ChunkKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Digest of a chunk: keyed when a key is present, plain SHA-256 otherwise.
pub fn chunk_digest(key: Option<&ChunkKey>, data: &[u8]) -> Result<String> {
    match key {
        Some(k) => k.digest(data),
        None => Ok(hex_encode(&Sha256::digest(data))),
    }
}

fn decode_key_text(s: &str) -> Result<[u8; 32]> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("key file is empty"));
    }
    let bytes = if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        decode_hex(s)?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(|e| anyhow!("key is neither 64 hex chars nor base64: {}", e))?
    };
    slice32(&bytes)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for i in (0..bytes.len()).step_by(2) {
        let h = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i))?;
        let l = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i + 1))?;
        out.push(((h << 4) | l) as u8);
    }
    Ok(out)
}

fn slice32(bytes: &[u8]) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("key must be exactly 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}
