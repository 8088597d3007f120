//! Blob framing for chunks and config files.
//!
//! Header (LE, 16 bytes):
//!   [magic 4 "PBB1"][flags u8][reserved 3][raw_len u32][crc32 u32]
//! Body: payload, or [nonce 12][tag 16][ciphertext] when encrypted.
//! crc32 covers the body. Compression (zstd) happens before encryption and is kept
//! only when it actually shrinks the payload.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::OsRng;
use rand::RngCore;

use super::keys::ChunkKey;

const MAGIC: &[u8; 4] = b"PBB1";
const HEADER_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub const FLAG_ZSTD: u8 = 0x01;
pub const FLAG_ENCRYPTED: u8 = 0x02;

const ZSTD_LEVEL: i32 = 3;

pub fn encode_blob(raw: &[u8], key: Option<&ChunkKey>) -> Result<Vec<u8>> {
    if raw.len() > u32::MAX as usize {
        return Err(anyhow!("blob too large: {} bytes", raw.len()));
    }
    let mut flags = 0u8;

    let mut payload = match zstd::bulk::compress(raw, ZSTD_LEVEL) {
        Ok(c) if c.len() < raw.len() => {
            flags |= FLAG_ZSTD;
            c
        }
        _ => raw.to_vec(),
    };

    let mut body = Vec::with_capacity(payload.len() + NONCE_LEN + TAG_LEN);
    match key {
        Some(k) => {
            flags |= FLAG_ENCRYPTED;
            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k.bytes()));
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad(flags), &mut payload)
                .map_err(|e| anyhow!("blob encrypt aes-gcm: {}", e))?;
            body.extend_from_slice(&nonce);
            body.extend_from_slice(tag.as_slice());
            body.extend_from_slice(&payload);
        }
        None => body.extend_from_slice(&payload),
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.push(flags);
    out.extend_from_slice(&[0u8; 3]);
    let mut buf4 = [0u8; 4];
    LittleEndian::write_u32(&mut buf4, raw.len() as u32);
    out.extend_from_slice(&buf4);
    LittleEndian::write_u32(&mut buf4, crc32fast::hash(&body));
    out.extend_from_slice(&buf4);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_blob(blob: &[u8], key: Option<&ChunkKey>) -> Result<Vec<u8>> {
    if blob.len() < HEADER_LEN {
        return Err(anyhow!("blob too short ({} bytes)", blob.len()));
    }
    if &blob[..4] != MAGIC {
        return Err(anyhow!("bad blob magic"));
    }
    let flags = blob[4];
    let raw_len = LittleEndian::read_u32(&blob[8..12]) as usize;
    let crc = LittleEndian::read_u32(&blob[12..16]);
    let body = &blob[HEADER_LEN..];
    if crc32fast::hash(body) != crc {
        return Err(anyhow!("blob checksum mismatch"));
    }

    let payload = if flags & FLAG_ENCRYPTED != 0 {
        let k = key.ok_or_else(|| anyhow!("blob is encrypted but no key was given"))?;
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("encrypted blob truncated"));
        }
        let nonce = &body[..NONCE_LEN];
        let tag = &body[NONCE_LEN..NONCE_LEN + TAG_LEN];
        let mut ct = body[NONCE_LEN + TAG_LEN..].to_vec();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k.bytes()));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &aad(flags),
                &mut ct,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| anyhow!("blob decrypt failed (wrong key?)"))?;
        ct
    } else {
        body.to_vec()
    };

    let raw = if flags & FLAG_ZSTD != 0 {
        zstd::bulk::decompress(&payload, raw_len).map_err(|e| anyhow!("blob zstd: {}", e))?
    } else {
        payload
    };
    if raw.len() != raw_len {
        return Err(anyhow!(
            "blob length mismatch: header {} vs decoded {}",
            raw_len,
            raw.len()
        ));
    }
    Ok(raw)
}

fn aad(flags: u8) -> [u8; 5] {
    [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], flags]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_data_is_compressed() {
        let raw = vec![0u8; 64 * 1024];
        let blob = encode_blob(&raw, None).unwrap();
        assert!(blob.len() < raw.len() / 10);
        assert_eq!(blob[4] & FLAG_ZSTD, FLAG_ZSTD);
        assert_eq!(decode_blob(&blob, None).unwrap(), raw);
    }

    #[test]
    fn encrypted_blob_needs_the_right_key() {
        let k1 = ChunkKey::from_bytes([1u8; 32]);
        let k2 = ChunkKey::from_bytes([2u8; 32]);
        let raw = b"secret disk contents".to_vec();
        let blob = encode_blob(&raw, Some(&k1)).unwrap();
        assert!(!blob.windows(raw.len()).any(|w| w == raw.as_slice()));
        assert_eq!(decode_blob(&blob, Some(&k1)).unwrap(), raw);
        assert!(decode_blob(&blob, Some(&k2)).is_err());
        assert!(decode_blob(&blob, None).is_err());
    }

    #[test]
    fn corrupted_blob_fails_checksum() {
        let mut blob = encode_blob(b"abcdefgh", None).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        let err = decode_blob(&blob, None).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }
}
