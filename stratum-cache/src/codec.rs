//! Wire format for serializing tiers.
//!
//! An entry is stored as a JSON envelope carrying its metadata and a base64
//! payload. The payload is LZ4 compressed and/or AES-256-GCM encrypted when the
//! entry's strategy flags ask for it; the nonce is prepended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use stratum_core::constants::{ENCRYPTION_KEY_SIZE, ENCRYPTION_NONCE_SIZE};
use stratum_core::{CacheEntry, DataType, SerializationError};

const ENVELOPE_VERSION: u8 = 1;

/// Upper bound on how far one LZ4 block can expand.
const MAX_LZ4_RATIO: usize = 255;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    key: String,
    data_type: DataType,
    #[serde(default)]
    tags: BTreeSet<String>,
    version: u64,
    ttl_ms: u64,
    compressed: bool,
    encrypted: bool,
    payload: String,
}

/// Encodes and decodes entries for tiers that store bytes.
pub struct EntryCodec {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for EntryCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCodec")
            .field("encryption", &self.cipher.is_some())
            .finish()
    }
}

impl EntryCodec {
    /// Codec without encryption. Entries flagged `encrypted` fail to encode.
    pub fn plain() -> Self {
        Self { cipher: None }
    }

    pub fn with_key(key: &[u8; ENCRYPTION_KEY_SIZE]) -> Self {
        Self {
            cipher: Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))),
        }
    }

    pub fn new(key: Option<[u8; ENCRYPTION_KEY_SIZE]>) -> Self {
        match key {
            Some(k) => Self::with_key(&k),
            None => Self::plain(),
        }
    }

    pub fn encode(&self, entry: &CacheEntry, now: Instant) -> Result<Vec<u8>, SerializationError> {
        let mut payload = if entry.compressed {
            lz4_flex::compress_prepend_size(&entry.value)
        } else {
            entry.value.clone()
        };

        if entry.encrypted {
            payload = self.encrypt(&entry.key, &payload)?;
        }

        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            key: entry.key.clone(),
            data_type: entry.data_type.clone(),
            tags: entry.tags.clone(),
            version: entry.version,
            ttl_ms: entry.remaining_ttl(now).as_millis() as u64,
            compressed: entry.compressed,
            encrypted: entry.encrypted,
            payload: BASE64.encode(payload),
        };

        serde_json::to_vec(&envelope).map_err(|e| SerializationError::Encode {
            key: entry.key.clone(),
            reason: e.to_string(),
        })
    }

    /// Rebuild an entry. `remaining` is the lifetime left as reported by the store.
    pub fn decode(
        &self,
        key: &str,
        bytes: &[u8],
        remaining: Duration,
        now: Instant,
    ) -> Result<CacheEntry, SerializationError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if envelope.v != ENVELOPE_VERSION {
            return Err(SerializationError::VersionMismatch {
                key: key.to_string(),
                version: envelope.v,
            });
        }
        if envelope.key != key {
            return Err(SerializationError::Decode {
                key: key.to_string(),
                reason: format!("envelope belongs to {}", envelope.key),
            });
        }

        let mut payload = BASE64
            .decode(envelope.payload.as_bytes())
            .map_err(|e| SerializationError::Decode {
                key: key.to_string(),
                reason: format!("invalid base64 payload: {e}"),
            })?;

        if envelope.encrypted {
            payload = self.decrypt(key, &payload)?;
        }
        if envelope.compressed {
            payload = decompress(key, &payload)?;
        }

        let entry = CacheEntry::new(key, payload, envelope.data_type, remaining, now)
            .with_tags(envelope.tags)
            .with_version(envelope.version)
            .with_transforms(envelope.compressed, envelope.encrypted);
        Ok(entry)
    }

    /// Read only the tag set, without touching the payload.
    pub fn tags_of(&self, key: &str, bytes: &[u8]) -> Result<BTreeSet<String>, SerializationError> {
        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            tags: BTreeSet<String>,
        }
        serde_json::from_slice::<Tags>(bytes)
            .map(|t| t.tags)
            .map_err(|e| SerializationError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, SerializationError> {
        let cipher = self.cipher.as_ref().ok_or_else(|| SerializationError::Encode {
            key: key.to_string(),
            reason: "encryption requested but no key is configured".to_string(),
        })?;

        let mut nonce_bytes = [0u8; ENCRYPTION_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SerializationError::Encode {
                key: key.to_string(),
                reason: format!("encryption failed: {e}"),
            })?;

        let mut out = Vec::with_capacity(ENCRYPTION_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &str, data: &[u8]) -> Result<Vec<u8>, SerializationError> {
        let decrypt_err = || SerializationError::Decrypt {
            key: key.to_string(),
        };
        let cipher = self.cipher.as_ref().ok_or_else(decrypt_err)?;
        if data.len() < ENCRYPTION_NONCE_SIZE {
            return Err(decrypt_err());
        }
        let (nonce_bytes, ciphertext) = data.split_at(ENCRYPTION_NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| decrypt_err())
    }
}

/// Decompress a size-prepended LZ4 block, refusing size prefixes the block
/// could not possibly expand to.
fn decompress(key: &str, data: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let fail = |reason: String| SerializationError::Decompress {
        key: key.to_string(),
        reason,
    };
    if data.len() < 4 {
        return Err(fail("missing size prefix".to_string()));
    }
    let (prefix, block) = data.split_at(4);
    let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let limit = block.len().saturating_mul(MAX_LZ4_RATIO);
    if claimed > limit {
        return Err(fail(format!(
            "size prefix {claimed} exceeds {limit} for a {} byte block",
            block.len()
        )));
    }
    lz4_flex::decompress(block, claimed).map_err(|e| fail(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    fn sample(compressed: bool, encrypted: bool, now: Instant) -> CacheEntry {
        CacheEntry::new(
            "note:1",
            b"hello hello hello hello hello".to_vec(),
            DataType::from("note"),
            Duration::from_secs(60),
            now,
        )
        .with_tags(["user:1"])
        .with_version(4)
        .with_transforms(compressed, encrypted)
    }

    #[test]
    fn test_compressed_and_encrypted_payload_roundtrips() {
        let codec = EntryCodec::with_key(&KEY);
        let now = Instant::now();
        let entry = sample(true, true, now);

        let bytes = codec.encode(&entry, now).unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("hello"));

        let decoded = codec.decode("note:1", &bytes, Duration::from_secs(30), now).unwrap();
        assert_eq!(decoded.value, entry.value);
        assert_eq!(decoded.tags, entry.tags);
        assert_eq!(decoded.version, 4);
        assert_eq!(decoded.data_type, DataType::from("note"));
        assert!(decoded.compressed && decoded.encrypted);
        assert_eq!(decoded.remaining_ttl(now), Duration::from_secs(30));
    }

    #[test]
    fn test_encrypt_without_key_fails_encode() {
        let codec = EntryCodec::plain();
        let now = Instant::now();
        let err = codec.encode(&sample(false, true, now), now).unwrap_err();
        assert!(matches!(err, SerializationError::Encode { .. }));
    }

    #[test]
    fn test_wrong_key_fails_decrypt() {
        let now = Instant::now();
        let bytes = EntryCodec::with_key(&KEY)
            .encode(&sample(false, true, now), now)
            .unwrap();
        let other = EntryCodec::with_key(&[9u8; 32]);
        let err = other.decode("note:1", &bytes, Duration::from_secs(1), now).unwrap_err();
        assert_eq!(
            err,
            SerializationError::Decrypt {
                key: "note:1".to_string()
            }
        );
    }

    #[test]
    fn test_corrupt_bytes_fail_decode() {
        let codec = EntryCodec::plain();
        let now = Instant::now();
        let err = codec
            .decode("k", b"not json", Duration::from_secs(1), now)
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));
    }

    #[test]
    fn test_unknown_envelope_version_rejected() {
        let codec = EntryCodec::plain();
        let now = Instant::now();
        let bytes = codec.encode(&sample(false, false, now), now).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["v"] = serde_json::json!(9);
        let tampered = serde_json::to_vec(&value).unwrap();
        let err = codec
            .decode("note:1", &tampered, Duration::from_secs(1), now)
            .unwrap_err();
        assert!(matches!(err, SerializationError::VersionMismatch { version: 9, .. }));
    }

    #[test]
    fn test_oversized_size_prefix_rejected() {
        let codec = EntryCodec::plain();
        let now = Instant::now();
        let bytes = codec.encode(&sample(true, false, now), now).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let forged = [0xFF, 0xFF, 0xFF, 0x7F, 0x10, 0x61];
        value["payload"] = serde_json::json!(BASE64.encode(forged));
        let tampered = serde_json::to_vec(&value).unwrap();

        let err = codec
            .decode("note:1", &tampered, Duration::from_secs(1), now)
            .unwrap_err();
        match err {
            SerializationError::Decompress { reason, .. } => assert!(reason.contains("size prefix")),
            other => panic!("Expected decompress error, got: {:?}", other),
        }

        let truncated = [0x01, 0x00];
        value["payload"] = serde_json::json!(BASE64.encode(truncated));
        let tampered = serde_json::to_vec(&value).unwrap();
        let err = codec
            .decode("note:1", &tampered, Duration::from_secs(1), now)
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decompress { .. }));
    }
}
