//! Minimal DER walker for X.509 certificates.
//!
//! Only descends far enough to pull the RSA public key out of
//! `tbsCertificate.subjectPublicKeyInfo`. Nothing is validated beyond
//! structure: no signature, validity period or chain checks.

use crate::util::{KError, KResult};

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_EXPLICIT_0: u8 = 0xA0;

/// 1.2.840.113549.1.1.1
const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

/// RSA key material borrowed from a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsaKeyComponents<'a> {
    pub modulus: &'a [u8],
    pub exponent: &'a [u8],
}

struct Der<'a> {
    data: &'a [u8],
}

impl<'a> Der<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Lê um TLV e avança.
    fn read(&mut self) -> KResult<(u8, &'a [u8])> {
        let data = self.data;
        if data.len() < 2 {
            return Err(KError::Protocol);
        }
        let tag = data[0];
        let (len, header) = match data[1] {
            short @ 0..=0x7F => (short as usize, 2),
            0x80 => return Err(KError::Protocol),
            long => {
                let count = (long & 0x7F) as usize;
                if count > 4 || data.len() < 2 + count {
                    return Err(KError::Protocol);
                }
                let len = data[2..2 + count]
                    .iter()
                    .fold(0usize, |acc, &b| (acc << 8) | b as usize);
                (len, 2 + count)
            }
        };
        let end = header.checked_add(len).ok_or(KError::Protocol)?;
        if end > data.len() {
            return Err(KError::Protocol);
        }
        self.data = &data[end..];
        Ok((tag, &data[header..end]))
    }

    fn expect(&mut self, tag: u8) -> KResult<&'a [u8]> {
        match self.read()? {
            (t, body) if t == tag => Ok(body),
            _ => Err(KError::Protocol),
        }
    }

    fn skip(&mut self) -> KResult<()> {
        self.read().map(|_| ())
    }
}

fn strip_leading_zero(int: &[u8]) -> &[u8] {
    match int {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => int,
    }
}

/// Extrai (modulus, exponent) do primeiro certificado DER.
pub fn rsa_public_key_from_cert(cert: &[u8]) -> KResult<RsaKeyComponents<'_>> {
    let mut outer = Der::new(Der::new(cert).expect(TAG_SEQUENCE)?);
    let mut tbs = Der::new(outer.expect(TAG_SEQUENCE)?);

    if tbs.peek_tag() == Some(TAG_EXPLICIT_0) {
        tbs.skip()?; // version
    }
    tbs.skip()?; // serialNumber
    tbs.skip()?; // signature
    tbs.skip()?; // issuer
    tbs.skip()?; // validity
    tbs.skip()?; // subject

    let mut spki = Der::new(tbs.expect(TAG_SEQUENCE)?);
    let mut algorithm = Der::new(spki.expect(TAG_SEQUENCE)?);
    if algorithm.expect(TAG_OID)? != OID_RSA_ENCRYPTION {
        return Err(KError::NotSupported);
    }

    let bits = spki.expect(TAG_BIT_STRING)?;
    let Some((&0, key)) = bits.split_first() else {
        return Err(KError::Protocol);
    };

    let mut rsa_key = Der::new(Der::new(key).expect(TAG_SEQUENCE)?);
    let modulus = strip_leading_zero(rsa_key.expect(TAG_INTEGER)?);
    let exponent = strip_leading_zero(rsa_key.expect(TAG_INTEGER)?);
    if modulus.is_empty() || exponent.is_empty() {
        return Err(KError::Protocol);
    }
    Ok(RsaKeyComponents { modulus, exponent })
}
