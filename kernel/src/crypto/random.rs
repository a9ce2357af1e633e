//! Random byte source
//!
//! Kernel randomness is a ChaCha20 stream seeded from RDRAND. Everything that
//! needs randomness takes a `CryptoRngCore`, so tests can seed their own.

use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

pub use rand_core::{CryptoRng, CryptoRngCore, RngCore};

use crate::util::{KError, KResult};

/// Fill `out` with random bytes
pub fn random_bytes<R: RngCore + ?Sized>(rng: &mut R, out: &mut [u8]) {
    rng.fill_bytes(out);
}

/// Generator with a caller-provided seed.
pub fn seeded(seed: [u8; 32]) -> ChaCha20Rng {
    ChaCha20Rng::from_seed(seed)
}

/// Kernel generator seeded from the CPU's hardware RNG.
#[cfg(target_arch = "x86_64")]
pub fn kernel_rng() -> KResult<ChaCha20Rng> {
    use x86_64::instructions::random::RdRand;

    let rdrand = RdRand::new().ok_or(KError::NotSupported)?;
    let mut seed = [0u8; 32];
    for chunk in seed.chunks_mut(8) {
        let word = rdrand.get_u64().ok_or(KError::IO)?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Ok(seeded(seed))
}

#[cfg(not(target_arch = "x86_64"))]
pub fn kernel_rng() -> KResult<ChaCha20Rng> {
    Err(KError::NotSupported)
}
