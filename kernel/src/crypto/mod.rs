//! Cryptographic Primitives
//!
//! Facade over the primitives the TLS client consumes:
//! - SHA-256 hash function and HMAC
//! - AES-128-CBC (no padding; the record layer pads)
//! - RSA PKCS#1 v1.5 public-key encryption
//! - X.509 DER walk down to the RSA public key
//! - P-256 ephemeral ECDH
//! - random byte source

pub mod aes;
pub mod asn1;
pub mod ec;
pub mod random;
pub mod rsa;
pub mod sha256;

// Re-export commonly used items
pub use self::aes::{cbc_decrypt, cbc_encrypt, BLOCK_SIZE as AES_BLOCK_SIZE};
pub use self::ec::EphemeralKey;
pub use self::random::{random_bytes, CryptoRngCore};
pub use self::rsa::RsaPublicKey;
pub use self::sha256::{hmac_sha256, hmac_sha256_parts, sha256, Sha256, Sha256Digest};

/// Constant-time comparison of byte slices
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
