//! Test doubles: manual clock, scripted IP layer, loopback TCP peer and an
//! in-memory TLS 1.2 server.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

use crate::crypto::asn1::tests::fake_cert;
use crate::crypto::ec::{PeerPoint, POINT_LEN};
use crate::crypto::{EphemeralKey, Sha256};
use crate::net::https::Resolver;
use crate::net::segment::{SegmentHeader, TcpFlags, TcpSegment};
use crate::net::socket::Transport;
use crate::net::tls::handshake::{
    take_message, wrap_handshake, HS_CERTIFICATE, HS_CLIENT_HELLO, HS_CLIENT_KEY_EXCHANGE, HS_FINISHED, HS_SERVER_HELLO,
    HS_SERVER_HELLO_DONE, HS_SERVER_KEY_EXCHANGE, NAMED_CURVE, SECP256R1, TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256,
    TLS_RSA_WITH_AES_128_CBC_SHA256,
};
use crate::net::tls::prf::{master_secret, verify_data, KeyBlock, MASTER_SECRET_LEN};
use crate::net::tls::record::{frame, DirectionKeys, RecordLayer, MAX_FRAGMENT};
use crate::net::tls::{
    ALERT_CLOSE_NOTIFY, ALERT_LEVEL_WARNING, CONTENT_ALERT, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC,
    CONTENT_HANDSHAKE, TLS_VERSION_1_2,
};
use crate::net::{Inbound, IpLayer, Ipv4Addr, PROTO_TCP};
use crate::time::Clock;
use crate::util::{KError, KResult};

pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Clock advanced by hand; `idle()` moves it one tick so waits terminate.
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn advance(&self, ticks: u64) {
        self.0.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn ticks(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn idle(&self) {
        self.advance(1);
    }
}

#[allow(clippy::too_many_arguments)]
pub fn segment_to(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    SegmentHeader { src_port, dst_port, seq, ack, flags, window }.build(payload, src, dst)
}

enum SynReply {
    Accept { from: Ipv4Addr, isn: u32, window: u16 },
    Reset { from: Ipv4Addr },
}

/// IP layer that records what the stack sends and feeds queued datagrams back.
pub struct ScriptedIp {
    clock: ManualClock,
    inbox: VecDeque<Inbound>,
    sent: Vec<(u64, Ipv4Addr, Vec<u8>)>,
    syn_reply: Option<SynReply>,
}

impl ScriptedIp {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, inbox: VecDeque::new(), sent: Vec::new(), syn_reply: None }
    }

    pub fn deliver(&mut self, src: Ipv4Addr, segment: Vec<u8>) {
        self.inbox.push_back(Inbound { src, protocol: PROTO_TCP, payload: segment });
    }

    /// Answer every SYN sent to `from` with a SYN-ACK.
    pub fn respond_to_syn(&mut self, from: Ipv4Addr, isn: u32, window: u16) {
        self.syn_reply = Some(SynReply::Accept { from, isn, window });
    }

    pub fn reset_on_syn(&mut self, from: Ipv4Addr) {
        self.syn_reply = Some(SynReply::Reset { from });
    }

    pub fn take_sent(&mut self) -> Vec<(Ipv4Addr, Vec<u8>)> {
        self.sent.drain(..).map(|(_, dst, pkt)| (dst, pkt)).collect()
    }

    pub fn take_sent_at(&mut self) -> Vec<(u64, Ipv4Addr, Vec<u8>)> {
        core::mem::take(&mut self.sent)
    }
}

impl IpLayer for ScriptedIp {
    fn send_packet(&mut self, dst: Ipv4Addr, _protocol: u8, payload: &[u8]) -> KResult<()> {
        self.sent.push((self.clock.ticks(), dst, payload.to_vec()));

        let Some(seg) = TcpSegment::parse(payload) else {
            return Ok(());
        };
        if !seg.has(TcpFlags::SYN) || seg.has(TcpFlags::ACK) {
            return Ok(());
        }
        let reply = match self.syn_reply {
            Some(SynReply::Accept { from, isn, window }) if from == dst => segment_to(
                dst,
                CLIENT_IP,
                seg.dst_port,
                seg.src_port,
                isn,
                seg.seq.wrapping_add(1),
                TcpFlags::SYN | TcpFlags::ACK,
                window,
                &[],
            ),
            Some(SynReply::Reset { from }) if from == dst => segment_to(
                dst,
                CLIENT_IP,
                seg.dst_port,
                seg.src_port,
                0,
                seg.seq.wrapping_add(1),
                TcpFlags::RST | TcpFlags::ACK,
                0,
                &[],
            ),
            _ => return Ok(()),
        };
        self.deliver(dst, reply);
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<Inbound> {
        self.inbox.pop_front()
    }
}

// === Loopback servers ===

/// Server side of a byte stream: consumes what the client sent, returns the reply.
pub trait StreamApp {
    fn on_data(&mut self, data: &[u8]) -> Vec<u8>;

    /// Once true, the server side closes after flushing its reply.
    fn wants_close(&self) -> bool {
        false
    }
}

/// Prefixes every chunk with `echo: `.
#[derive(Default)]
pub struct EchoApp;

impl StreamApp for EchoApp {
    fn on_data(&mut self, data: &[u8]) -> Vec<u8> {
        [b"echo: ".as_slice(), data].concat()
    }
}

/// Requests seen by an [`HttpApp`], in order.
pub type RequestLog = Arc<spin::Mutex<Vec<String>>>;

/// Waits for a full request head, answers with a canned response and closes.
pub struct HttpApp {
    request: Vec<u8>,
    response: Vec<u8>,
    answered: bool,
    keep_alive: bool,
    log: Option<RequestLog>,
}

impl HttpApp {
    pub fn new(response: &str) -> Self {
        Self { request: Vec::new(), response: response.as_bytes().to_vec(), answered: false, keep_alive: false, log: None }
    }

    /// Answers but leaves the connection open, like an HTTP/1.1 keep-alive server.
    pub fn keep_alive(response: &str) -> Self {
        Self { keep_alive: true, ..Self::new(response) }
    }

    pub fn logged(response: &str, log: RequestLog) -> Self {
        Self { log: Some(log), ..Self::new(response) }
    }
}

impl StreamApp for HttpApp {
    fn on_data(&mut self, data: &[u8]) -> Vec<u8> {
        self.request.extend_from_slice(data);
        if self.answered || !self.request.windows(4).any(|w| w == b"\r\n\r\n") {
            return Vec::new();
        }
        self.answered = true;
        if let Some(log) = &self.log {
            log.lock().push(String::from_utf8_lossy(&self.request).into_owned());
        }
        self.response.clone()
    }

    fn wants_close(&self) -> bool {
        self.answered && !self.keep_alive
    }
}

/// `Transport` wired straight to a [`StreamApp`]; replies queue up for `recv`.
pub struct LoopbackTransport<A: StreamApp> {
    app: A,
    pending: VecDeque<u8>,
}

impl<A: StreamApp> LoopbackTransport<A> {
    pub fn new(app: A) -> Self {
        Self { app, pending: VecDeque::new() }
    }

    pub fn into_inner(self) -> A {
        self.app
    }
}

impl<A: StreamApp> Transport for LoopbackTransport<A> {
    fn send(&mut self, data: &[u8]) -> KResult<usize> {
        let reply = self.app.on_data(data);
        self.pending.extend(reply);
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout_ms: u32) -> KResult<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// === In-memory TLS 1.2 server ===

#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    pub suite: u16,
    /// Largest handshake record the server writes; small values split messages.
    pub record_chunk: usize,
    pub skip_key_exchange: bool,
    pub bad_finished: bool,
    pub corrupt_app_data: bool,
    /// Send close_notify right after the first reply.
    pub close_after_reply: bool,
}

impl TlsServerOptions {
    pub fn rsa() -> Self {
        Self {
            suite: TLS_RSA_WITH_AES_128_CBC_SHA256,
            record_chunk: MAX_FRAGMENT,
            skip_key_exchange: false,
            bad_finished: false,
            corrupt_app_data: false,
            close_after_reply: false,
        }
    }

    pub fn ecdhe() -> Self {
        Self { suite: TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256, ..Self::rsa() }
    }
}

/// 512-bit key shared by every test server; generating one per test is slow.
fn server_rsa_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = ChaCha20Rng::seed_from_u64(0x5EED);
        RsaPrivateKey::new(&mut rng, 512).expect("rsa key generation")
    })
    .clone()
}

/// Server half of a TLS 1.2 handshake, built from the crate's own record layer
/// and PRF. Speaks [`StreamApp`] so it can sit behind a transport or a TCP peer.
pub struct TlsTestServer {
    options: TlsServerOptions,
    app: Box<dyn StreamApp + Send>,
    rng: ChaCha20Rng,
    key: RsaPrivateKey,
    ecdh: Option<EphemeralKey>,
    records: RecordLayer,
    inbox: Vec<u8>,
    hs_buf: Vec<u8>,
    transcript: Sha256,
    client_random: [u8; 32],
    server_random: [u8; 32],
    master: [u8; MASTER_SECRET_LEN],
    keys: Option<KeyBlock>,
    client_finished_ok: bool,
    close_notify_seen: bool,
    close_sent: bool,
    app_records: Vec<usize>,
}

impl TlsTestServer {
    pub fn new(options: TlsServerOptions, app: impl StreamApp + Send + 'static) -> Self {
        Self {
            options,
            app: Box::new(app),
            rng: ChaCha20Rng::seed_from_u64(7),
            key: server_rsa_key(),
            ecdh: None,
            records: RecordLayer::new(),
            inbox: Vec::new(),
            hs_buf: Vec::new(),
            transcript: Sha256::new(),
            client_random: [0; 32],
            server_random: [0; 32],
            master: [0; MASTER_SECRET_LEN],
            keys: None,
            client_finished_ok: false,
            close_notify_seen: false,
            close_sent: false,
            app_records: Vec::new(),
        }
    }

    pub fn client_finished_ok(&self) -> bool {
        self.client_finished_ok
    }

    pub fn saw_close_notify(&self) -> bool {
        self.close_notify_seen
    }

    /// Plaintext length of each application record received.
    pub fn app_records(&self) -> &[usize] {
        &self.app_records
    }

    fn certificate(&self) -> Vec<u8> {
        let cert = fake_cert(&self.key.n().to_bytes_be(), &self.key.e().to_bytes_be());
        let mut body = Vec::new();
        body.extend_from_slice(&u24(cert.len() + 3));
        body.extend_from_slice(&u24(cert.len()));
        body.extend_from_slice(&cert);
        wrap_handshake(HS_CERTIFICATE, &body)
    }

    fn server_flight(&mut self) -> Vec<u8> {
        self.rng.fill_bytes(&mut self.server_random);

        let mut hello = Vec::new();
        hello.extend_from_slice(&TLS_VERSION_1_2.to_be_bytes());
        hello.extend_from_slice(&self.server_random);
        hello.push(0);
        hello.extend_from_slice(&self.options.suite.to_be_bytes());
        hello.push(0);

        let mut flight = wrap_handshake(HS_SERVER_HELLO, &hello);
        flight.extend_from_slice(&self.certificate());

        if self.options.suite == TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 && !self.options.skip_key_exchange {
            let ecdh = EphemeralKey::generate(&mut self.rng);
            let mut ske = Vec::from([NAMED_CURVE]);
            ske.extend_from_slice(&SECP256R1.to_be_bytes());
            ske.push(POINT_LEN as u8);
            ske.extend_from_slice(ecdh.public_point());
            // Signature is never checked by the client.
            ske.extend_from_slice(&[0x04, 0x01, 0x00, 0x02, 0xAA, 0xBB]);
            flight.extend_from_slice(&wrap_handshake(HS_SERVER_KEY_EXCHANGE, &ske));
            self.ecdh = Some(ecdh);
        }

        flight.extend_from_slice(&wrap_handshake(HS_SERVER_HELLO_DONE, &[]));
        flight
    }

    fn handle_handshake(&mut self, msg: &[u8], out: &mut Vec<u8>) {
        let body = &msg[4..];
        match msg[0] {
            HS_CLIENT_HELLO => {
                self.transcript.update(msg);
                self.client_random.copy_from_slice(&body[2..34]);
                let flight = self.server_flight();
                self.transcript.update(&flight);
                for chunk in flight.chunks(self.options.record_chunk) {
                    out.extend_from_slice(&frame(CONTENT_HANDSHAKE, chunk));
                }
            }
            HS_CLIENT_KEY_EXCHANGE => {
                self.transcript.update(msg);
                let pre_master = match &self.ecdh {
                    Some(ecdh) => {
                        let point = PeerPoint::from_uncompressed(&body[1..]).expect("client point");
                        ecdh.shared_secret(&point).to_vec()
                    }
                    None => {
                        let len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        self.key.decrypt(Pkcs1v15Encrypt, &body[2..2 + len]).expect("pre-master decrypt")
                    }
                };
                self.master = master_secret(&pre_master, &self.client_random, &self.server_random);
                self.keys = Some(KeyBlock::derive(&self.master, &self.client_random, &self.server_random));
            }
            HS_FINISHED => {
                let expected = verify_data(&self.master, b"client finished", &self.transcript.snapshot());
                self.client_finished_ok = body == expected;
                self.transcript.update(msg);

                out.extend_from_slice(&frame(CONTENT_CHANGE_CIPHER_SPEC, &[1]));
                if let Some(keys) = &self.keys {
                    self.records.activate_write(DirectionKeys::new(keys.server_mac, keys.server_key));
                }
                let mut verify = verify_data(&self.master, b"server finished", &self.transcript.snapshot());
                if self.options.bad_finished {
                    verify[0] ^= 0xFF;
                }
                let finished = wrap_handshake(HS_FINISHED, &verify);
                out.extend_from_slice(&self.seal(CONTENT_HANDSHAKE, &finished));
            }
            _ => {}
        }
    }

    fn seal(&mut self, content_type: u8, content: &[u8]) -> Vec<u8> {
        self.records.seal(content_type, content, &mut self.rng).expect("server seal")
    }

    fn handle_app_data(&mut self, content: &[u8], out: &mut Vec<u8>) {
        self.app_records.push(content.len());
        let reply = self.app.on_data(content);
        for chunk in reply.chunks(MAX_FRAGMENT) {
            let mut record = self.seal(CONTENT_APPLICATION_DATA, chunk);
            if self.options.corrupt_app_data {
                let last = record.len() - 1;
                record[last] ^= 0x01;
            }
            out.extend_from_slice(&record);
        }
        if (self.options.close_after_reply || self.app.wants_close()) && !self.close_sent {
            self.close_sent = true;
            out.extend_from_slice(&self.seal(CONTENT_ALERT, &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY]));
        }
    }
}

fn u24(v: usize) -> [u8; 3] {
    [(v >> 16) as u8, (v >> 8) as u8, v as u8]
}

impl StreamApp for TlsTestServer {
    fn on_data(&mut self, data: &[u8]) -> Vec<u8> {
        self.inbox.extend_from_slice(data);
        let mut out = Vec::new();

        while self.inbox.len() >= 5 {
            let len = u16::from_be_bytes([self.inbox[3], self.inbox[4]]) as usize;
            if self.inbox.len() < 5 + len {
                break;
            }
            let record: Vec<u8> = self.inbox.drain(..5 + len).collect();
            let content_type = record[0];
            let content = self.records.open(content_type, &record[5..]).expect("client record");

            match content_type {
                CONTENT_HANDSHAKE => {
                    self.hs_buf.extend_from_slice(&content);
                    while let Some(msg) = take_message(&mut self.hs_buf).expect("client handshake framing") {
                        self.handle_handshake(&msg, &mut out);
                    }
                }
                CONTENT_CHANGE_CIPHER_SPEC => {
                    if let Some(keys) = &self.keys {
                        self.records.activate_read(DirectionKeys::new(keys.client_mac, keys.client_key));
                    }
                }
                CONTENT_APPLICATION_DATA => self.handle_app_data(&content, &mut out),
                CONTENT_ALERT => self.close_notify_seen |= content.get(1) == Some(&ALERT_CLOSE_NOTIFY),
                _ => {}
            }
        }
        out
    }

    fn wants_close(&self) -> bool {
        self.close_sent
    }
}

// === Loopback TCP peer ===

const PEER_ISN: u32 = 1000;
const PEER_SEGMENT: usize = 1000;

type AppFactory = Box<dyn FnMut() -> Box<dyn StreamApp + Send> + Send>;

struct PeerConn {
    ip: Ipv4Addr,
    port: u16,
    client_port: u16,
    snd_nxt: u32,
    rcv_nxt: u32,
    fin_sent: bool,
    app: Box<dyn StreamApp + Send>,
}

/// IP layer that plays a minimal TCP server for each registered address,
/// answering synchronously from inside `send_packet`. It never retransmits.
pub struct LoopbackPeer {
    hosts: Vec<(Ipv4Addr, u16, AppFactory)>,
    conns: Vec<PeerConn>,
    inbox: VecDeque<Inbound>,
    connects: Vec<Ipv4Addr>,
}

impl Default for LoopbackPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackPeer {
    pub fn new() -> Self {
        Self { hosts: Vec::new(), conns: Vec::new(), inbox: VecDeque::new(), connects: Vec::new() }
    }

    /// Accept connections to `ip:port`, one fresh app per connection.
    pub fn serve<F, A>(&mut self, ip: Ipv4Addr, port: u16, mut factory: F)
    where
        F: FnMut() -> A + Send + 'static,
        A: StreamApp + Send + 'static,
    {
        let make: AppFactory = Box::new(move || -> Box<dyn StreamApp + Send> { Box::new(factory()) });
        self.hosts.push((ip, port, make));
    }

    /// Addresses that completed a SYN exchange, in order.
    pub fn connects(&self) -> &[Ipv4Addr] {
        &self.connects
    }

    fn emit(&mut self, idx: usize, seq: u32, flags: TcpFlags, payload: &[u8]) {
        let conn = &self.conns[idx];
        let segment = segment_to(conn.ip, CLIENT_IP, conn.port, conn.client_port, seq, conn.rcv_nxt, flags, 65535, payload);
        self.inbox.push_back(Inbound { src: conn.ip, protocol: PROTO_TCP, payload: segment });
    }

    fn accept(&mut self, dst: Ipv4Addr, seg: &TcpSegment<'_>) {
        let Some((_, _, factory)) = self.hosts.iter_mut().find(|(ip, port, _)| *ip == dst && *port == seg.dst_port) else {
            let rst = segment_to(dst, CLIENT_IP, seg.dst_port, seg.src_port, 0, seg.seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK, 0, &[]);
            self.inbox.push_back(Inbound { src: dst, protocol: PROTO_TCP, payload: rst });
            return;
        };
        let app = factory();
        self.conns.retain(|c| !(c.ip == dst && c.client_port == seg.src_port));
        self.conns.push(PeerConn {
            ip: dst,
            port: seg.dst_port,
            client_port: seg.src_port,
            snd_nxt: PEER_ISN.wrapping_add(1),
            rcv_nxt: seg.seq.wrapping_add(1),
            fin_sent: false,
            app,
        });
        self.connects.push(dst);
        let idx = self.conns.len() - 1;
        self.emit(idx, PEER_ISN, TcpFlags::SYN | TcpFlags::ACK, &[]);
    }

    fn segment(&mut self, idx: usize, seg: &TcpSegment<'_>) {
        if seg.has(TcpFlags::RST) {
            self.conns.remove(idx);
            return;
        }

        let mut replies: Vec<(TcpFlags, Vec<u8>)> = Vec::new();
        let conn = &mut self.conns[idx];
        if !seg.payload.is_empty() {
            if seg.seq == conn.rcv_nxt {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                let reply = conn.app.on_data(seg.payload);
                replies.push((TcpFlags::ACK, Vec::new()));
                for chunk in reply.chunks(PEER_SEGMENT) {
                    replies.push((TcpFlags::PSH | TcpFlags::ACK, chunk.to_vec()));
                }
                if conn.app.wants_close() && !conn.fin_sent {
                    replies.push((TcpFlags::FIN | TcpFlags::ACK, Vec::new()));
                }
            } else {
                replies.push((TcpFlags::ACK, Vec::new()));
            }
        }

        let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
        if seg.has(TcpFlags::FIN) && fin_seq == conn.rcv_nxt {
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
            let already = conn.fin_sent || replies.iter().any(|(f, _)| f.contains(TcpFlags::FIN));
            replies.push(if already { (TcpFlags::ACK, Vec::new()) } else { (TcpFlags::FIN | TcpFlags::ACK, Vec::new()) });
        }

        for (flags, payload) in replies {
            let seq = self.conns[idx].snd_nxt;
            self.emit(idx, seq, flags, &payload);
            let conn = &mut self.conns[idx];
            conn.snd_nxt = conn.snd_nxt.wrapping_add(payload.len() as u32);
            if flags.contains(TcpFlags::FIN) {
                conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                conn.fin_sent = true;
            }
        }
    }
}

impl IpLayer for LoopbackPeer {
    fn send_packet(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> KResult<()> {
        if protocol != PROTO_TCP {
            return Ok(());
        }
        let Some(seg) = TcpSegment::parse(payload) else {
            return Ok(());
        };

        if seg.has(TcpFlags::SYN) && !seg.has(TcpFlags::ACK) {
            self.accept(dst, &seg);
        } else if let Some(idx) = self
            .conns
            .iter()
            .position(|c| c.ip == dst && c.port == seg.dst_port && c.client_port == seg.src_port)
        {
            self.segment(idx, &seg);
        }
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<Inbound> {
        self.inbox.pop_front()
    }
}

/// Fixed host table.
pub struct StaticResolver(pub Vec<(&'static str, Ipv4Addr)>);

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str) -> KResult<Ipv4Addr> {
        self.0.iter().find(|(name, _)| *name == host).map(|(_, ip)| *ip).ok_or(KError::NotFound)
    }
}
