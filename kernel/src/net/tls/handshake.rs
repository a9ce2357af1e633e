//! Mensagens de handshake TLS 1.2 (lado cliente).

use alloc::vec::Vec;

use super::TLS_VERSION_1_2;
use crate::crypto::asn1::rsa_public_key_from_cert;
use crate::crypto::ec::{PeerPoint, POINT_LEN};
use crate::crypto::RsaPublicKey;
use crate::util::{KError, KResult};

pub const HEADER_LEN: usize = 4;

/// Maior mensagem de handshake aceita (cadeias de certificados cabem folgado)
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

// Handshake Types
pub const HS_CLIENT_HELLO: u8 = 1;
pub const HS_SERVER_HELLO: u8 = 2;
pub const HS_CERTIFICATE: u8 = 11;
pub const HS_SERVER_KEY_EXCHANGE: u8 = 12;
pub const HS_SERVER_HELLO_DONE: u8 = 14;
pub const HS_CLIENT_KEY_EXCHANGE: u8 = 16;
pub const HS_FINISHED: u8 = 20;

// Cipher Suites
pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256: u16 = 0xC027;
pub const TLS_RSA_WITH_AES_128_CBC_SHA256: u16 = 0x003C;

// Extension Types
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
const EXT_EC_POINT_FORMATS: u16 = 0x000B;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000D;

pub const NAMED_CURVE: u8 = 3;
pub const SECP256R1: u16 = 0x0017;

/// sha256/384/512 + sha1 com RSA, sha256 + sha1 com ECDSA
const SIGNATURE_ALGORITHMS: [u16; 6] = [0x0401, 0x0501, 0x0601, 0x0201, 0x0403, 0x0203];

/// Troca de chaves negociada
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchange {
    Ecdhe,
    Rsa,
}

impl KeyExchange {
    pub fn from_suite(suite: u16) -> KResult<Self> {
        match suite {
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 => Ok(KeyExchange::Ecdhe),
            TLS_RSA_WITH_AES_128_CBC_SHA256 => Ok(KeyExchange::Rsa),
            _ => Err(KError::NotSupported),
        }
    }

    pub fn suite(self) -> u16 {
        match self {
            KeyExchange::Ecdhe => TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256,
            KeyExchange::Rsa => TLS_RSA_WITH_AES_128_CBC_SHA256,
        }
    }
}

/// Cursor com checagem de limites; qualquer estouro é erro de protocolo.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> KResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(KError::Protocol)?;
        let out = self.data.get(self.pos..end).ok_or(KError::Protocol)?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> KResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> KResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> KResult<usize> {
        let b = self.bytes(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u24(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
    push_u16(out, ext_type);
    push_u16(out, body.len() as u16);
    out.extend_from_slice(body);
}

/// Tipo (1) + tamanho (3) + corpo.
pub fn wrap_handshake(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + body.len());
    msg.push(msg_type);
    push_u24(&mut msg, body.len());
    msg.extend_from_slice(body);
    msg
}

/// Retira a próxima mensagem completa (cabeçalho incluído) de `buf`.
/// Comprimento declarado acima de [`MAX_MESSAGE_LEN`] é erro de protocolo.
pub fn take_message(buf: &mut Vec<u8>) -> KResult<Option<Vec<u8>>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(KError::Protocol);
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }
    let rest = buf.split_off(HEADER_LEN + len);
    Ok(Some(core::mem::replace(buf, rest)))
}

fn extensions(host: &str) -> Vec<u8> {
    let mut ext = Vec::new();

    // Server Name Indication
    let name = host.as_bytes();
    let mut sni = Vec::with_capacity(name.len() + 5);
    push_u16(&mut sni, (name.len() + 3) as u16);
    sni.push(0); // host_name
    push_u16(&mut sni, name.len() as u16);
    sni.extend_from_slice(name);
    push_extension(&mut ext, EXT_SERVER_NAME, &sni);

    let mut algs = Vec::with_capacity(2 + 2 * SIGNATURE_ALGORITHMS.len());
    push_u16(&mut algs, (2 * SIGNATURE_ALGORITHMS.len()) as u16);
    for alg in SIGNATURE_ALGORITHMS {
        push_u16(&mut algs, alg);
    }
    push_extension(&mut ext, EXT_SIGNATURE_ALGORITHMS, &algs);

    let mut groups = Vec::with_capacity(4);
    push_u16(&mut groups, 2);
    push_u16(&mut groups, SECP256R1);
    push_extension(&mut ext, EXT_SUPPORTED_GROUPS, &groups);

    // uncompressed only
    push_extension(&mut ext, EXT_EC_POINT_FORMATS, &[1, 0]);
    ext
}

/// ClientHello completo, pronto para o transcript.
pub fn client_hello(client_random: &[u8; 32], host: &str) -> Vec<u8> {
    let mut hello = Vec::with_capacity(128 + host.len());
    push_u16(&mut hello, TLS_VERSION_1_2);
    hello.extend_from_slice(client_random);
    hello.push(0); // session id vazio

    push_u16(&mut hello, 4);
    push_u16(&mut hello, TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256);
    push_u16(&mut hello, TLS_RSA_WITH_AES_128_CBC_SHA256);

    hello.extend_from_slice(&[1, 0]); // compressão nula

    let ext = extensions(host);
    push_u16(&mut hello, ext.len() as u16);
    hello.extend_from_slice(&ext);

    wrap_handshake(HS_CLIENT_HELLO, &hello)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub key_exchange: KeyExchange,
}

pub fn parse_server_hello(body: &[u8]) -> KResult<ServerHello> {
    let mut r = Reader::new(body);
    if r.u16()? != TLS_VERSION_1_2 {
        return Err(KError::NotSupported);
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(r.bytes(32)?);
    let session_len = r.u8()? as usize;
    r.bytes(session_len)?;
    let key_exchange = KeyExchange::from_suite(r.u16()?)?;
    if r.u8()? != 0 {
        return Err(KError::Protocol);
    }
    // Extensões do servidor são ignoradas
    Ok(ServerHello { random, key_exchange })
}

/// Chave RSA do primeiro certificado da cadeia. A cadeia não é validada.
pub fn parse_certificate(body: &[u8]) -> KResult<RsaPublicKey> {
    let mut r = Reader::new(body);
    let list_len = r.u24()?;
    let mut list = Reader::new(r.bytes(list_len)?);
    let cert_len = list.u24()?;
    if cert_len == 0 {
        return Err(KError::Protocol);
    }
    let cert = list.bytes(cert_len)?;

    let key = rsa_public_key_from_cert(cert)?;
    RsaPublicKey::from_components(key.modulus, key.exponent)
}

/// Ponto ECDHE do servidor. A assinatura que segue não é verificada.
pub fn parse_server_key_exchange(body: &[u8]) -> KResult<PeerPoint> {
    let mut r = Reader::new(body);
    if r.u8()? != NAMED_CURVE || r.u16()? != SECP256R1 {
        return Err(KError::NotSupported);
    }
    let point_len = r.u8()? as usize;
    if point_len != POINT_LEN {
        return Err(KError::Protocol);
    }
    PeerPoint::from_uncompressed(r.bytes(point_len)?)
}

pub fn client_key_exchange_ecdhe(public_point: &[u8; POINT_LEN]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + POINT_LEN);
    body.push(POINT_LEN as u8);
    body.extend_from_slice(public_point);
    wrap_handshake(HS_CLIENT_KEY_EXCHANGE, &body)
}

pub fn client_key_exchange_rsa(encrypted_pms: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + encrypted_pms.len());
    push_u16(&mut body, encrypted_pms.len() as u16);
    body.extend_from_slice(encrypted_pms);
    wrap_handshake(HS_CLIENT_KEY_EXCHANGE, &body)
}
