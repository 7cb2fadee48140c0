//! Content fingerprinting for duplicate detection.
//!
//! The digest covers the NFC-normalized, trimmed content plus the parameter
//! tuple (ontology, target_words, overlap_words). Whitespace differences
//! inside the content still produce different digests; only leading and
//! trailing whitespace is stripped.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// 256-bit content digest, rendered as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentFingerprint([u8; 32]);

impl ContentFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Derive a distinct fingerprint for a forced re-ingest by folding a
    /// random salt into the digest. The result shares no lookup key with
    /// the original.
    pub fn with_random_salt(&self) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(salt);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<ContentFingerprint> for String {
    fn from(fp: ContentFingerprint) -> Self {
        fp.to_hex()
    }
}

impl TryFrom<String> for ContentFingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid fingerprint hex: {value:?}"))
    }
}

/// Compute the fingerprint of one ingestion request.
pub fn fingerprint(
    content: &str,
    ontology: &str,
    target_words: u32,
    overlap_words: u32,
) -> ContentFingerprint {
    let normalized: String = content.trim().nfc().collect();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(ontology.as_bytes());
    hasher.update([0u8]);
    hasher.update(target_words.to_be_bytes());
    hasher.update(overlap_words.to_be_bytes());
    ContentFingerprint(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = fingerprint("hello world", "notes", 1000, 200);
        let b = fingerprint("hello world", "notes", 1000, 200);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ontology_is_part_of_the_key() {
        let a = fingerprint("hello world", "notes", 1000, 200);
        let b = fingerprint("hello world", "papers", 1000, 200);
        assert_ne!(a, b);
    }

    #[test]
    fn test_chunk_params_are_part_of_the_key() {
        let a = fingerprint("hello world", "notes", 1000, 200);
        let b = fingerprint("hello world", "notes", 500, 200);
        let c = fingerprint("hello world", "notes", 1000, 100);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_interior_whitespace_matters() {
        let a = fingerprint("hello world", "notes", 1000, 200);
        let b = fingerprint("hello  world", "notes", 1000, 200);
        assert_ne!(a, b);
    }

    #[test]
    fn test_outer_whitespace_trimmed() {
        let a = fingerprint("hello world", "notes", 1000, 200);
        let b = fingerprint("  hello world\n", "notes", 1000, 200);
        assert_eq!(a, b);
    }

    #[test]
    fn test_nfc_normalization() {
        // U+00E9 vs e + U+0301 combining acute
        let a = fingerprint("caf\u{00e9}", "notes", 1000, 200);
        let b = fingerprint("cafe\u{0301}", "notes", 1000, 200);
        assert_eq!(a, b);
    }

    #[test]
    fn test_salt_produces_distinct_digest() {
        let a = fingerprint("hello", "notes", 1000, 200);
        let salted = a.with_random_salt();
        assert_ne!(a, salted);
    }

    #[test]
    fn test_hex_roundtrip() {
        let a = fingerprint("hello", "notes", 1000, 200);
        let hex = a.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentFingerprint::from_hex(&hex), Some(a));
        assert_eq!(ContentFingerprint::from_hex("zz"), None);
    }
}
