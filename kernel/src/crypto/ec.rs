//! P-256 (secp256r1) ephemeral Diffie-Hellman.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;

use super::random::CryptoRngCore;
use crate::util::{KError, KResult};

/// Uncompressed SEC1 point: 0x04 || X || Y
pub const POINT_LEN: usize = 65;

/// Ephemeral key pair for one ECDHE exchange.
pub struct EphemeralKey {
    secret: EphemeralSecret,
    public: [u8; POINT_LEN],
}

impl EphemeralKey {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let secret = EphemeralSecret::random(rng);
        let encoded = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; POINT_LEN];
        public.copy_from_slice(encoded.as_bytes());
        Self { secret, public }
    }

    /// Our public point, uncompressed.
    pub fn public_point(&self) -> &[u8; POINT_LEN] {
        &self.public
    }

    /// X coordinate of the shared point.
    pub fn shared_secret(&self, peer: &PeerPoint) -> [u8; 32] {
        let shared = self.secret.diffie_hellman(&peer.0);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        out
    }
}

/// Peer public point, checked to lie on the curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPoint(PublicKey);

impl PeerPoint {
    pub fn from_uncompressed(bytes: &[u8]) -> KResult<Self> {
        if bytes.len() != POINT_LEN || bytes[0] != 0x04 {
            return Err(KError::Protocol);
        }
        PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| KError::Protocol)
    }
}
