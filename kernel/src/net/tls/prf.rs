//! TLS 1.2 PRF (P_SHA256) and the key schedule built on it.

use alloc::vec::Vec;

use crate::crypto::{hmac_sha256, hmac_sha256_parts, Sha256Digest};

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;
const KEY_BLOCK_LEN: usize = 2 * 32 + 2 * 16;

/// PRF(secret, label, seed) truncado em `length` bytes.
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(length + 32);

    // A(1) = HMAC(secret, label || seed)
    let mut a: Sha256Digest = hmac_sha256_parts(secret, &[label, seed]);
    while out.len() < length {
        out.extend_from_slice(&hmac_sha256_parts(secret, &[&a, label, seed]));
        a = hmac_sha256(secret, &a);
    }

    out.truncate(length);
    out
}

pub fn master_secret(pre_master: &[u8], client_random: &[u8; 32], server_random: &[u8; 32]) -> [u8; MASTER_SECRET_LEN] {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);

    let mut master = [0u8; MASTER_SECRET_LEN];
    master.copy_from_slice(&prf(pre_master, b"master secret", &seed, MASTER_SECRET_LEN));
    master
}

/// Chaves por direção derivadas do key block.
#[derive(Clone)]
pub struct KeyBlock {
    pub client_mac: [u8; 32],
    pub server_mac: [u8; 32],
    pub client_key: [u8; 16],
    pub server_key: [u8; 16],
}

impl KeyBlock {
    pub fn derive(master: &[u8; MASTER_SECRET_LEN], client_random: &[u8; 32], server_random: &[u8; 32]) -> Self {
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(server_random);
        seed[32..].copy_from_slice(client_random);
        let block = prf(master, b"key expansion", &seed, KEY_BLOCK_LEN);

        let mut keys = Self {
            client_mac: [0; 32],
            server_mac: [0; 32],
            client_key: [0; 16],
            server_key: [0; 16],
        };
        keys.client_mac.copy_from_slice(&block[0..32]);
        keys.server_mac.copy_from_slice(&block[32..64]);
        keys.client_key.copy_from_slice(&block[64..80]);
        keys.server_key.copy_from_slice(&block[80..96]);
        keys
    }
}

/// verify_data do Finished para `label` ("client finished" / "server finished").
pub fn verify_data(master: &[u8; MASTER_SECRET_LEN], label: &[u8], transcript: &Sha256Digest) -> [u8; VERIFY_DATA_LEN] {
    let mut out = [0u8; VERIFY_DATA_LEN];
    out.copy_from_slice(&prf(master, label, transcript, VERIFY_DATA_LEN));
    out
}
