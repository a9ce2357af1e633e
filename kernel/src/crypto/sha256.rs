//! SHA-256 Hash Function
//!
//! Thin layer over `sha2`/`hmac` with the fixed-size outputs TLS wants.

use hmac::{Hmac, Mac};
use sha2::Digest;

/// SHA-256 digest (32 bytes)
pub type Sha256Digest = [u8; 32];

type HmacSha256 = Hmac<sha2::Sha256>;

/// SHA-256 hasher state. Cloning snapshots a running transcript.
#[derive(Clone, Default)]
pub struct Sha256(sha2::Sha256);

impl Sha256 {
    pub fn new() -> Self {
        Self(sha2::Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Sha256Digest {
        digest_bytes(&self.0.finalize())
    }

    /// Hash of everything fed so far, leaving the state usable.
    pub fn snapshot(&self) -> Sha256Digest {
        self.clone().finalize()
    }
}

fn digest_bytes(bytes: &[u8]) -> Sha256Digest {
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    out
}

/// Compute SHA-256 hash of data
pub fn sha256(data: &[u8]) -> Sha256Digest {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize()
}

fn keyed(key: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC takes keys of any length.
        Err(_) => unreachable!("hmac rejected key"),
    }
}

/// HMAC-SHA256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Sha256Digest {
    hmac_sha256_parts(key, &[data])
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256_parts(key: &[u8], parts: &[&[u8]]) -> Sha256Digest {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    digest_bytes(&mac.finalize().into_bytes())
}
