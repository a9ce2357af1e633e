//! TLS record layer: framing plus MAC-then-encrypt (AES-128-CBC + HMAC-SHA256).

use alloc::vec::Vec;
use log::trace;

use super::{CONTENT_ALERT, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE, TLS_VERSION_1_2};
use crate::crypto::random::RngCore;
use crate::crypto::{cbc_decrypt, cbc_encrypt, constant_time_eq, hmac_sha256_parts, AES_BLOCK_SIZE};
use crate::net::socket::Transport;
use crate::util::{KError, KResult};

pub const HEADER_LEN: usize = 5;
/// Maior fragmento em claro que enviamos
pub const MAX_FRAGMENT: usize = 16384;
/// Maior corpo de record aceito na recepção
pub const MAX_RECORD_LEN: usize = MAX_FRAGMENT + 512;
const MAC_LEN: usize = 32;

/// Record recebido, ainda sem decifrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub content_type: u8,
    pub body: Vec<u8>,
}

/// Estado criptográfico de uma direção.
pub struct DirectionKeys {
    mac_key: [u8; 32],
    key: [u8; 16],
    seq: u64,
}

impl DirectionKeys {
    pub fn new(mac_key: [u8; 32], key: [u8; 16]) -> Self {
        Self { mac_key, key, seq: 0 }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn mac(&self, content_type: u8, content: &[u8]) -> [u8; MAC_LEN] {
        let [major, minor] = TLS_VERSION_1_2.to_be_bytes();
        hmac_sha256_parts(
            &self.mac_key,
            &[
                &self.seq.to_be_bytes(),
                &[content_type, major, minor],
                &(content.len() as u16).to_be_bytes(),
                content,
            ],
        )
    }
}

/// Cabeçalho + corpo de um record.
pub fn frame(content_type: u8, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + body.len());
    record.push(content_type);
    record.extend_from_slice(&TLS_VERSION_1_2.to_be_bytes());
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(body);
    record
}

/// Lê um record completo. `Ok(None)` se o stream terminou antes do cabeçalho.
pub fn read_record<T: Transport + ?Sized>(transport: &mut T, timeout_ms: u32) -> KResult<Option<RawRecord>> {
    let mut header = [0u8; HEADER_LEN];
    if !transport.recv_exact(&mut header, timeout_ms)? {
        return Ok(None);
    }

    let content_type = header[0];
    match content_type {
        CONTENT_CHANGE_CIPHER_SPEC | CONTENT_ALERT | CONTENT_HANDSHAKE | CONTENT_APPLICATION_DATA => {}
        _ => return Err(KError::Protocol),
    }
    if header[1] != 3 {
        return Err(KError::Protocol);
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(KError::Protocol);
    }

    let mut body = alloc::vec![0u8; len];
    if !transport.recv_exact(&mut body, timeout_ms)? && len > 0 {
        return Err(KError::ConnectionReset);
    }
    trace!("tls: rx record type {} len {}", content_type, len);
    Ok(Some(RawRecord { content_type, body }))
}

/// Estado do record layer nas duas direções.
#[derive(Default)]
pub struct RecordLayer {
    write: Option<DirectionKeys>,
    read: Option<DirectionKeys>,
}

impl RecordLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Liga a cifra de saída (após enviar ChangeCipherSpec).
    pub fn activate_write(&mut self, keys: DirectionKeys) {
        self.write = Some(keys);
    }

    /// Liga a cifra de entrada (após receber ChangeCipherSpec).
    pub fn activate_read(&mut self, keys: DirectionKeys) {
        self.read = Some(keys);
    }

    pub fn write_active(&self) -> bool {
        self.write.is_some()
    }

    pub fn read_active(&self) -> bool {
        self.read.is_some()
    }

    /// Monta o record de saída, cifrado se a direção estiver ativa.
    pub fn seal<R: RngCore + ?Sized>(&mut self, content_type: u8, content: &[u8], rng: &mut R) -> KResult<Vec<u8>> {
        if content.len() > MAX_FRAGMENT {
            return Err(KError::Invalid);
        }
        let Some(keys) = self.write.as_mut() else {
            return Ok(frame(content_type, content));
        };

        let mac = keys.mac(content_type, content);
        let pad_len = AES_BLOCK_SIZE - (content.len() + MAC_LEN) % AES_BLOCK_SIZE;

        let mut iv = [0u8; AES_BLOCK_SIZE];
        rng.fill_bytes(&mut iv);

        let mut body = Vec::with_capacity(AES_BLOCK_SIZE + content.len() + MAC_LEN + pad_len);
        body.extend_from_slice(&iv);
        body.extend_from_slice(content);
        body.extend_from_slice(&mac);
        body.resize(body.len() + pad_len, (pad_len - 1) as u8);

        cbc_encrypt(&keys.key, &iv, &mut body[AES_BLOCK_SIZE..])?;
        keys.seq = keys.seq.wrapping_add(1);
        Ok(frame(content_type, &body))
    }

    /// Decifra e valida o corpo de um record recebido.
    pub fn open(&mut self, content_type: u8, body: &[u8]) -> KResult<Vec<u8>> {
        let Some(keys) = self.read.as_mut() else {
            return Ok(body.to_vec());
        };

        if body.len() < 2 * AES_BLOCK_SIZE || body.len() % AES_BLOCK_SIZE != 0 {
            return Err(KError::BadRecordMac);
        }
        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv.copy_from_slice(&body[..AES_BLOCK_SIZE]);
        let mut plain = body[AES_BLOCK_SIZE..].to_vec();
        cbc_decrypt(&keys.key, &iv, &mut plain)?;

        let pad_byte = plain[plain.len() - 1];
        let pad_len = pad_byte as usize + 1;
        if pad_len > AES_BLOCK_SIZE || pad_len + MAC_LEN > plain.len() {
            return Err(KError::BadRecordMac);
        }
        if plain[plain.len() - pad_len..].iter().any(|&b| b != pad_byte) {
            return Err(KError::BadRecordMac);
        }

        let content_len = plain.len() - pad_len - MAC_LEN;
        let expected = keys.mac(content_type, &plain[..content_len]);
        if !constant_time_eq(&expected, &plain[content_len..content_len + MAC_LEN]) {
            return Err(KError::BadRecordMac);
        }

        keys.seq = keys.seq.wrapping_add(1);
        plain.truncate(content_len);
        Ok(plain)
    }
}
