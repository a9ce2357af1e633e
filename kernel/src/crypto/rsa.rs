//! RSA public-key encryption (PKCS#1 v1.5), used for the RSA key exchange.

use alloc::vec::Vec;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt};

use super::random::CryptoRngCore;
use crate::util::{KError, KResult};

/// RSA public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey(rsa::RsaPublicKey);

impl RsaPublicKey {
    /// Build from big-endian modulus and exponent bytes.
    pub fn from_components(modulus: &[u8], exponent: &[u8]) -> KResult<Self> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(exponent);
        rsa::RsaPublicKey::new(n, e)
            .map(Self)
            .map_err(|_| KError::NotSupported)
    }

    /// Modulus size in bytes
    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn encrypt_pkcs1<R: CryptoRngCore>(&self, rng: &mut R, msg: &[u8]) -> KResult<Vec<u8>> {
        self.0
            .encrypt(rng, Pkcs1v15Encrypt, msg)
            .map_err(|_| KError::Invalid)
    }
}

impl From<rsa::RsaPublicKey> for RsaPublicKey {
    fn from(key: rsa::RsaPublicKey) -> Self {
        Self(key)
    }
}
