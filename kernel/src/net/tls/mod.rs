//! TLS 1.2 Client
//!
//! Minimal client-side TLS supporting:
//! - TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 (preferred)
//! - TLS_RSA_WITH_AES_128_CBC_SHA256
//!
//! The certificate chain and the ServerKeyExchange signature are not
//! verified; the server Finished is.

pub mod handshake;
pub mod prf;
pub mod record;

use alloc::vec::Vec;
use log::{debug, trace};

use self::handshake::{KeyExchange, ServerHello};
use self::prf::{KeyBlock, MASTER_SECRET_LEN};
use self::record::{read_record, DirectionKeys, RecordLayer, MAX_FRAGMENT};
use crate::crypto::ec::PeerPoint;
use crate::crypto::{random_bytes, CryptoRngCore, EphemeralKey, RsaPublicKey, Sha256};
use crate::net::socket::Transport;
use crate::util::{KError, KResult};

// TLS Record Types
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

pub const TLS_VERSION_1_2: u16 = 0x0303;

// Alerts
pub const ALERT_LEVEL_WARNING: u8 = 1;
pub const ALERT_CLOSE_NOTIFY: u8 = 0;

/// Timeout de leitura do socket durante handshake e recv
pub const READ_TIMEOUT_MS: u32 = 15_000;

/// TLS Connection State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Initial,
    SentClientHello,
    ReceivedServerHelloDone,
    SentFinished,
    Established,
    Closed,
}

/// Primeiro voo do servidor, até o ServerHelloDone.
struct ServerFlight {
    hello: ServerHello,
    server_key: RsaPublicKey,
    server_point: Option<PeerPoint>,
}

/// TLS Connection over any blocking byte transport
pub struct TlsConnection<T: Transport, R: CryptoRngCore> {
    transport: T,
    rng: R,
    state: TlsState,
    records: RecordLayer,

    // Handshake hash (for Finished messages)
    transcript: Sha256,
    hs_buf: Vec<u8>,
    key_exchange: Option<KeyExchange>,

    // Application data already decrypted but not yet handed out
    rx: Vec<u8>,
    rx_pos: usize,
}

impl<T: Transport, R: CryptoRngCore> TlsConnection<T, R> {
    pub fn new(transport: T, rng: R) -> Self {
        Self {
            transport,
            rng,
            state: TlsState::Initial,
            records: RecordLayer::new(),
            transcript: Sha256::new(),
            hs_buf: Vec::new(),
            key_exchange: None,
            rx: Vec::new(),
            rx_pos: 0,
        }
    }

    /// Cria a conexão e executa o handshake completo com `host` (SNI).
    pub fn connect(transport: T, rng: R, host: &str) -> KResult<Self> {
        let mut conn = Self::new(transport, rng);
        conn.handshake(host)?;
        Ok(conn)
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == TlsState::Established
    }

    /// Suite negociada, se o ServerHello já chegou.
    pub fn cipher_suite(&self) -> Option<u16> {
        self.key_exchange.map(KeyExchange::suite)
    }

    /// Devolve o transporte subjacente.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Perform TLS handshake
    pub fn handshake(&mut self, host: &str) -> KResult<()> {
        if self.state != TlsState::Initial {
            return Err(KError::Invalid);
        }
        let result = self.run_handshake(host);
        if let Err(e) = result {
            debug!("tls: handshake with {} failed in {:?}: {}", host, self.state, e);
            self.state = TlsState::Closed;
        }
        result
    }

    fn run_handshake(&mut self, host: &str) -> KResult<()> {
        let mut client_random = [0u8; 32];
        random_bytes(&mut self.rng, &mut client_random);

        let hello = handshake::client_hello(&client_random, host);
        self.send_handshake(&hello)?;
        self.state = TlsState::SentClientHello;

        let flight = self.read_server_flight()?;
        self.state = TlsState::ReceivedServerHelloDone;
        let server_random = flight.hello.random;

        let (pre_master, cke) = self.client_key_exchange(&flight)?;
        self.send_handshake(&cke)?;

        let master = prf::master_secret(&pre_master, &client_random, &server_random);
        let keys = KeyBlock::derive(&master, &client_random, &server_random);

        // ChangeCipherSpec, depois Finished já cifrado
        self.send_record(CONTENT_CHANGE_CIPHER_SPEC, &[1])?;
        self.records.activate_write(DirectionKeys::new(keys.client_mac, keys.client_key));

        let verify = prf::verify_data(&master, b"client finished", &self.transcript.snapshot());
        let finished = handshake::wrap_handshake(handshake::HS_FINISHED, &verify);
        self.send_handshake(&finished)?;
        self.state = TlsState::SentFinished;

        self.read_server_finish(&master, &keys)?;
        self.state = TlsState::Established;
        debug!("tls: established with {} ({:?})", host, flight.hello.key_exchange);
        Ok(())
    }

    /// Lê ServerHello .. ServerHelloDone, atualizando o transcript.
    fn read_server_flight(&mut self) -> KResult<ServerFlight> {
        let mut hello: Option<ServerHello> = None;
        let mut server_key: Option<RsaPublicKey> = None;
        let mut server_point: Option<PeerPoint> = None;

        loop {
            let msg = self.next_handshake_message()?;
            let body = &msg[handshake::HEADER_LEN..];
            match msg[0] {
                handshake::HS_SERVER_HELLO => {
                    let parsed = handshake::parse_server_hello(body)?;
                    trace!("tls: server hello, {:?}", parsed.key_exchange);
                    self.key_exchange = Some(parsed.key_exchange);
                    hello = Some(parsed);
                }
                handshake::HS_CERTIFICATE => {
                    server_key = Some(handshake::parse_certificate(body)?);
                }
                handshake::HS_SERVER_KEY_EXCHANGE => match self.key_exchange {
                    Some(KeyExchange::Ecdhe) => server_point = Some(handshake::parse_server_key_exchange(body)?),
                    _ => return Err(KError::Protocol),
                },
                handshake::HS_SERVER_HELLO_DONE => break,
                other => trace!("tls: ignoring handshake message {}", other),
            }
        }

        let (Some(hello), Some(server_key)) = (hello, server_key) else {
            return Err(KError::Protocol);
        };
        if hello.key_exchange == KeyExchange::Ecdhe && server_point.is_none() {
            return Err(KError::Protocol);
        }
        Ok(ServerFlight { hello, server_key, server_point })
    }

    /// Calcula o pre-master secret e monta o ClientKeyExchange.
    fn client_key_exchange(&mut self, flight: &ServerFlight) -> KResult<(Vec<u8>, Vec<u8>)> {
        match (flight.hello.key_exchange, &flight.server_point) {
            (KeyExchange::Ecdhe, Some(point)) => {
                let key = EphemeralKey::generate(&mut self.rng);
                let shared = key.shared_secret(point);
                Ok((shared.to_vec(), handshake::client_key_exchange_ecdhe(key.public_point())))
            }
            (KeyExchange::Rsa, _) => {
                let mut pms = [0u8; MASTER_SECRET_LEN];
                pms[..2].copy_from_slice(&TLS_VERSION_1_2.to_be_bytes());
                random_bytes(&mut self.rng, &mut pms[2..]);
                let encrypted = flight.server_key.encrypt_pkcs1(&mut self.rng, &pms)?;
                Ok((pms.to_vec(), handshake::client_key_exchange_rsa(&encrypted)))
            }
            (KeyExchange::Ecdhe, None) => Err(KError::Protocol),
        }
    }

    /// ChangeCipherSpec do servidor seguido do Finished cifrado.
    fn read_server_finish(&mut self, master: &[u8; MASTER_SECRET_LEN], keys: &KeyBlock) -> KResult<()> {
        let (content_type, body) = self.next_record()?.ok_or(KError::ConnectionReset)?;
        if content_type != CONTENT_CHANGE_CIPHER_SPEC || body != [1u8] {
            return Err(KError::Protocol);
        }
        self.records.activate_read(DirectionKeys::new(keys.server_mac, keys.server_key));

        let expected = prf::verify_data(master, b"server finished", &self.transcript.snapshot());
        let msg = self.next_handshake_message()?;
        if msg[0] != handshake::HS_FINISHED || msg[handshake::HEADER_LEN..] != expected {
            debug!("tls: server finished does not match transcript");
            return Err(KError::Protocol);
        }
        Ok(())
    }

    /// Próxima mensagem de handshake, já incluída no transcript.
    fn next_handshake_message(&mut self) -> KResult<Vec<u8>> {
        loop {
            if let Some(msg) = handshake::take_message(&mut self.hs_buf)? {
                self.transcript.update(&msg);
                return Ok(msg);
            }
            let (content_type, body) = self.next_record()?.ok_or(KError::ConnectionReset)?;
            match content_type {
                CONTENT_HANDSHAKE => self.hs_buf.extend_from_slice(&body),
                CONTENT_ALERT => {
                    debug!("tls: alert during handshake: {:?}", body);
                    return Err(KError::Protocol);
                }
                _ => return Err(KError::Protocol),
            }
        }
    }

    /// Lê e decifra um record. `Ok(None)` no fim do stream.
    fn next_record(&mut self) -> KResult<Option<(u8, Vec<u8>)>> {
        let Some(raw) = read_record(&mut self.transport, READ_TIMEOUT_MS)? else {
            return Ok(None);
        };
        let content = self.records.open(raw.content_type, &raw.body)?;
        Ok(Some((raw.content_type, content)))
    }

    fn send_handshake(&mut self, msg: &[u8]) -> KResult<()> {
        self.transcript.update(msg);
        self.send_record(CONTENT_HANDSHAKE, msg)
    }

    fn send_record(&mut self, content_type: u8, content: &[u8]) -> KResult<()> {
        for chunk in content.chunks(MAX_FRAGMENT) {
            let record = self.records.seal(content_type, chunk, &mut self.rng)?;
            self.transport.send(&record)?;
        }
        Ok(())
    }

    /// Send application data
    pub fn send(&mut self, data: &[u8]) -> KResult<usize> {
        if self.state != TlsState::Established {
            return Err(KError::NotConnected);
        }
        if !data.is_empty() {
            self.send_record(CONTENT_APPLICATION_DATA, data)?;
        }
        Ok(data.len())
    }

    /// Receive application data. `Ok(0)` once the peer closed.
    pub fn recv(&mut self, buf: &mut [u8]) -> KResult<usize> {
        match self.state {
            TlsState::Established => {}
            TlsState::Closed if self.rx_pos >= self.rx.len() => return Ok(0),
            TlsState::Closed => {}
            _ => return Err(KError::NotConnected),
        }

        loop {
            if self.rx_pos < self.rx.len() {
                let n = buf.len().min(self.rx.len() - self.rx_pos);
                buf[..n].copy_from_slice(&self.rx[self.rx_pos..self.rx_pos + n]);
                self.rx_pos += n;
                return Ok(n);
            }
            if buf.is_empty() || self.state == TlsState::Closed {
                return Ok(0);
            }

            let Some((content_type, content)) = self.next_record()? else {
                self.state = TlsState::Closed;
                return Ok(0);
            };
            match content_type {
                CONTENT_APPLICATION_DATA => {
                    self.rx = content;
                    self.rx_pos = 0;
                }
                CONTENT_ALERT => {
                    if content.get(1) == Some(&ALERT_CLOSE_NOTIFY) {
                        trace!("tls: close_notify from peer");
                        self.state = TlsState::Closed;
                        return Ok(0);
                    }
                    debug!("tls: alert {:?}", content);
                    return Err(KError::Protocol);
                }
                // HelloRequest e afins: ignorados
                CONTENT_HANDSHAKE => trace!("tls: ignoring post-handshake message"),
                _ => return Err(KError::Protocol),
            }
        }
    }

    /// Envia close_notify e marca a conexão como fechada.
    pub fn close(&mut self) -> KResult<()> {
        let was_established = self.state == TlsState::Established;
        self.state = TlsState::Closed;
        if was_established {
            self.send_record(CONTENT_ALERT, &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY])?;
        }
        Ok(())
    }
}
