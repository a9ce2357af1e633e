//! AES-128 in CBC mode
//!
//! Buffers must already be a multiple of the block size; padding belongs to
//! the caller (the TLS record layer).

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::util::{KError, KResult};

pub const BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Encrypt `buf` in place.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) -> KResult<()> {
    if buf.len() % BLOCK_SIZE != 0 {
        return Err(KError::Invalid);
    }
    let len = buf.len();
    Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| KError::Invalid)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| KError::Invalid)?;
    Ok(())
}

/// Decrypt `buf` in place.
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) -> KResult<()> {
    if buf.len() % BLOCK_SIZE != 0 {
        return Err(KError::Invalid);
    }
    Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| KError::Invalid)?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| KError::Invalid)?;
    Ok(())
}
