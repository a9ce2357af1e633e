//! TCP (Transmission Control Protocol)
//!
//! `TcpStack` owns a fixed arena of TCBs and the IP layer beneath it. Blocking
//! calls advance the protocol by polling the stack they borrow; there is no
//! background task. Slots are addressed through [`ConnId`] handles carrying a
//! generation, so a reused slot never answers to a stale handle.

use alloc::vec::Vec;
use log::{debug, trace};

use super::ring::RingBuffer;
use super::segment::{self, SegmentHeader, TcpFlags, TcpSegment};
use super::{IpLayer, Ipv4Addr, NetConfig, PROTO_TCP};
use crate::time::{ms_to_ticks, Clock};
use crate::util::{KError, KResult};

/// Estados TCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Estados em que o número de sequência do peer já é conhecido
    fn is_synchronized(self) -> bool {
        matches!(
            self,
            TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait
                | TcpState::LastAck
        )
    }
}

/// Handle de uma conexão: índice do slot + geração.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    slot: usize,
    generation: u32,
}

impl ConnId {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Snapshot de um TCB (diagnóstico)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbInfo {
    pub state: TcpState,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub mss: usize,
    pub rto: u64,
    pub retries: u32,
}

/// Bloco de controle de conexão
struct Tcb {
    generation: u32,
    in_use: bool,
    state: TcpState,

    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    /// Filho pendente de um socket em LISTEN
    backlog: Option<ConnId>,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    mss: usize,

    rto: u64,
    retries: u32,
    last_send: u64,

    rx: RingBuffer,
}

impl Tcb {
    fn new(buffer_size: usize) -> Self {
        Self {
            generation: 0,
            in_use: false,
            state: TcpState::Closed,
            local_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            backlog: None,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            mss: 0,
            rto: 0,
            retries: 0,
            last_send: 0,
            rx: RingBuffer::with_capacity(buffer_size),
        }
    }

    fn window(&self) -> u16 {
        self.rx.free().min(u16::MAX as usize) as u16
    }

    fn release(&mut self) {
        self.state = TcpState::Closed;
        self.in_use = false;
        self.backlog = None;
    }
}

/// Engine TCP: tabela de TCBs + camada IP + relógio.
pub struct TcpStack<I: IpLayer, C: Clock> {
    config: NetConfig,
    ip: I,
    clock: C,
    tcbs: Vec<Tcb>,
    next_port: u16,
    last_sweep: u64,
}

impl<I: IpLayer, C: Clock> TcpStack<I, C> {
    pub fn new(config: NetConfig, ip: I, clock: C) -> Self {
        let tcbs = (0..config.tcp.max_connections)
            .map(|_| Tcb::new(config.tcp.buffer_size))
            .collect();
        let last_sweep = clock.ticks();
        Self {
            next_port: config.tcp.ephemeral_port_base,
            config,
            ip,
            clock,
            tcbs,
            last_sweep,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn ip_layer(&self) -> &I {
        &self.ip
    }

    pub fn ip_layer_mut(&mut self) -> &mut I {
        &mut self.ip
    }

    fn isn(&self) -> u32 {
        (self.clock.ticks() as u32).wrapping_mul(64)
    }

    fn lookup(&self, id: ConnId) -> KResult<&Tcb> {
        match self.tcbs.get(id.slot) {
            Some(tcb) if tcb.generation == id.generation => Ok(tcb),
            _ => Err(KError::Invalid),
        }
    }

    fn lookup_mut(&mut self, id: ConnId) -> KResult<&mut Tcb> {
        match self.tcbs.get_mut(id.slot) {
            Some(tcb) if tcb.generation == id.generation => Ok(tcb),
            _ => Err(KError::Invalid),
        }
    }

    fn id_of(&self, slot: usize) -> ConnId {
        ConnId { slot, generation: self.tcbs[slot].generation }
    }

    /// Reserva um slot livre e o reinicia.
    fn alloc(&mut self, local_port: u16, state: TcpState) -> Option<usize> {
        let slot = self.tcbs.iter().position(|t| !t.in_use)?;
        let iss = self.isn();
        let now = self.clock.ticks();
        let cfg = self.config.tcp;

        let tcb = &mut self.tcbs[slot];
        tcb.generation = tcb.generation.wrapping_add(1);
        tcb.in_use = true;
        tcb.state = state;
        tcb.local_port = local_port;
        tcb.remote_ip = Ipv4Addr::UNSPECIFIED;
        tcb.remote_port = 0;
        tcb.backlog = None;
        tcb.iss = iss;
        tcb.snd_una = iss;
        tcb.snd_nxt = iss;
        tcb.snd_wnd = 0;
        tcb.rcv_nxt = 0;
        tcb.mss = cfg.mss;
        tcb.rto = cfg.rto_initial;
        tcb.retries = 0;
        tcb.last_send = now;
        tcb.rx.clear();
        Some(slot)
    }

    fn ephemeral_port(&mut self) -> u16 {
        let base = self.config.tcp.ephemeral_port_base;
        loop {
            let port = self.next_port;
            self.next_port = if port == u16::MAX { base } else { port + 1 };
            let in_use = self.tcbs.iter().any(|t| t.in_use && t.local_port == port);
            if !in_use {
                return port;
            }
        }
    }

    /// Envia um segmento a partir do estado do TCB.
    fn send_segment(&mut self, slot: usize, flags: TcpFlags, seq: u32, payload: &[u8]) -> KResult<()> {
        let now = self.clock.ticks();
        let tcb = &mut self.tcbs[slot];
        let header = SegmentHeader {
            src_port: tcb.local_port,
            dst_port: tcb.remote_port,
            seq,
            ack: if flags.contains(TcpFlags::ACK) { tcb.rcv_nxt } else { 0 },
            flags,
            window: tcb.window(),
        };
        let packet = header.build(payload, self.config.ip, tcb.remote_ip);
        tcb.last_send = now;
        trace!("tcp: tx {:?} seq={} len={} -> {}:{}", flags, seq, payload.len(), tcb.remote_ip, tcb.remote_port);
        self.ip.send_packet(tcb.remote_ip, PROTO_TCP, &packet)
    }

    /// ACKs de controle: falha de transmissão só é logada.
    fn send_ack(&mut self, slot: usize) {
        let seq = self.tcbs[slot].snd_nxt;
        if let Err(e) = self.send_segment(slot, TcpFlags::ACK, seq, &[]) {
            debug!("tcp: ack on slot {} not sent: {}", slot, e);
        }
    }

    fn set_state(&mut self, slot: usize, state: TcpState) {
        let tcb = &mut self.tcbs[slot];
        if tcb.state != state {
            debug!("tcp: slot {} port {} {:?} -> {:?}", slot, tcb.local_port, tcb.state, state);
            tcb.state = state;
        }
    }

    // === API pública ===

    /// Aloca um TCB. `listen` abre passivamente em `port`.
    pub fn open(&mut self, port: u16, listen: bool) -> KResult<ConnId> {
        if listen && port == 0 {
            return Err(KError::Invalid);
        }
        let state = if listen { TcpState::Listen } else { TcpState::Closed };
        let slot = self.alloc(port, state).ok_or(KError::NoResources)?;
        debug!("tcp: open slot {} port {} listen={}", slot, port, listen);
        Ok(self.id_of(slot))
    }

    /// Connect ativo. Bloqueia até ESTABLISHED ou o prazo de conexão.
    pub fn connect(&mut self, id: ConnId, remote_ip: Ipv4Addr, remote_port: u16) -> KResult<()> {
        if self.lookup(id)?.state != TcpState::Closed {
            return Err(KError::Invalid);
        }
        let local_port = match self.lookup(id)?.local_port {
            0 => self.ephemeral_port(),
            port => port,
        };
        let iss = self.isn();

        let tcb = self.lookup_mut(id)?;
        tcb.local_port = local_port;
        tcb.remote_ip = remote_ip;
        tcb.remote_port = remote_port;
        tcb.iss = iss;
        tcb.snd_una = iss;
        tcb.retries = 0;
        tcb.state = TcpState::SynSent;

        // Envia SYN
        self.send_segment(id.slot, TcpFlags::SYN, iss, &[])?;
        self.tcbs[id.slot].snd_nxt = iss.wrapping_add(1);
        debug!("tcp: connect {}:{} from port {}", remote_ip, remote_port, local_port);

        let deadline = self.clock.ticks() + self.config.tcp.connect_timeout;
        loop {
            self.poll();
            match self.lookup(id)?.state {
                TcpState::SynSent => {}
                TcpState::Established => return Ok(()),
                TcpState::Closed => return Err(KError::ConnectionReset),
                _ => return Err(KError::NotConnected),
            }
            if self.clock.ticks() >= deadline {
                debug!("tcp: connect to {}:{} timed out", remote_ip, remote_port);
                return Err(KError::Timeout);
            }
            self.clock.idle();
        }
    }

    /// Envia `data` em segmentos de até MSS bytes. Sem back-pressure:
    /// retorna sempre `data.len()` em caso de sucesso.
    pub fn send(&mut self, id: ConnId, data: &[u8]) -> KResult<usize> {
        match self.lookup(id)?.state {
            TcpState::Established | TcpState::CloseWait => {}
            _ => return Err(KError::NotConnected),
        }

        let mss = self.tcbs[id.slot].mss.max(1);
        for chunk in data.chunks(mss) {
            let seq = self.tcbs[id.slot].snd_nxt;
            self.send_segment(id.slot, TcpFlags::PSH | TcpFlags::ACK, seq, chunk)?;
            let tcb = &mut self.tcbs[id.slot];
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(chunk.len() as u32);

            // Processa ACKs entre os chunks
            self.poll();
            match self.lookup(id)?.state {
                TcpState::Established | TcpState::CloseWait => {}
                _ => return Err(KError::ConnectionReset),
            }
        }
        Ok(data.len())
    }

    /// Leitura não bloqueante. `Ok(0)` significa fim de stream.
    pub fn try_recv(&mut self, id: ConnId, buf: &mut [u8]) -> KResult<usize> {
        let tcb = self.lookup_mut(id)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !tcb.rx.is_empty() {
            return Ok(tcb.rx.read(buf));
        }
        match tcb.state {
            TcpState::Listen => Err(KError::Invalid),
            TcpState::SynSent
            | TcpState::SynReceived
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2 => Err(KError::WouldBlock),
            TcpState::Closed | TcpState::CloseWait | TcpState::LastAck | TcpState::TimeWait => Ok(0),
        }
    }

    /// Recebe dados, bloqueando até `timeout_ms`.
    pub fn recv(&mut self, id: ConnId, buf: &mut [u8], timeout_ms: u32) -> KResult<usize> {
        let deadline = self.clock.ticks() + ms_to_ticks(timeout_ms as u64);
        loop {
            self.poll();
            match self.try_recv(id, buf) {
                Err(KError::WouldBlock) => {}
                other => return other,
            }
            if self.clock.ticks() >= deadline {
                return Err(KError::Timeout);
            }
            self.clock.idle();
        }
    }

    /// Copia dados pendentes sem consumi-los.
    pub fn peek(&self, id: ConnId, buf: &mut [u8]) -> KResult<usize> {
        Ok(self.lookup(id)?.rx.peek(0, buf))
    }

    /// Bytes disponíveis para leitura (FIONREAD)
    pub fn available(&self, id: ConnId) -> KResult<usize> {
        Ok(self.lookup(id)?.rx.len())
    }

    /// Accept não bloqueante sobre um TCB em LISTEN.
    pub fn try_accept(&mut self, listener: ConnId) -> KResult<ConnId> {
        let tcb = self.lookup(listener)?;
        if tcb.state != TcpState::Listen {
            return Err(KError::Invalid);
        }
        let Some(child) = tcb.backlog else {
            return Err(KError::WouldBlock);
        };

        match self.lookup(child).map(|c| (c.in_use, c.state)) {
            Ok((true, TcpState::Established)) => {
                self.tcbs[listener.slot].backlog = None;
                Ok(child)
            }
            Ok((true, TcpState::SynReceived)) => Err(KError::WouldBlock),
            _ => {
                // Filho morreu antes do handshake terminar
                self.tcbs[listener.slot].backlog = None;
                Err(KError::WouldBlock)
            }
        }
    }

    /// Bloqueia (halt entre polls) até uma conexão completar o handshake.
    pub fn accept(&mut self, listener: ConnId) -> KResult<ConnId> {
        loop {
            self.poll();
            match self.try_accept(listener) {
                Err(KError::WouldBlock) => self.clock.idle(),
                other => return other,
            }
        }
    }

    /// Envia FIN sem esperar: ESTABLISHED -> FIN_WAIT_1, CLOSE_WAIT -> LAST_ACK.
    /// `Ok(false)` quando não há FIN a enviar neste estado.
    pub fn shutdown(&mut self, id: ConnId) -> KResult<bool> {
        let next = match self.lookup(id)?.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return Ok(false),
        };

        let seq = self.tcbs[id.slot].snd_nxt;
        if let Err(e) = self.send_segment(id.slot, TcpFlags::FIN | TcpFlags::ACK, seq, &[]) {
            debug!("tcp: fin on slot {} not sent: {}", id.slot, e);
        }
        let tcb = &mut self.tcbs[id.slot];
        tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
        self.set_state(id.slot, next);
        Ok(true)
    }

    /// Fecha a conexão (best-effort) e libera o slot.
    pub fn close(&mut self, id: ConnId) -> KResult<()> {
        if self.shutdown(id)? {
            let deadline = self.clock.ticks() + self.config.tcp.close_timeout;
            loop {
                self.poll();
                match self.lookup(id)?.state {
                    TcpState::Closed | TcpState::TimeWait => break,
                    _ => {}
                }
                if self.clock.ticks() >= deadline {
                    debug!("tcp: close on slot {} timed out", id.slot);
                    break;
                }
                self.clock.idle();
            }
        }

        self.set_state(id.slot, TcpState::Closed);
        self.tcbs[id.slot].release();
        Ok(())
    }

    pub fn state(&self, id: ConnId) -> KResult<TcpState> {
        Ok(self.lookup(id)?.state)
    }

    pub fn info(&self, id: ConnId) -> KResult<TcbInfo> {
        let tcb = self.lookup(id)?;
        Ok(TcbInfo {
            state: tcb.state,
            local_port: tcb.local_port,
            remote_ip: tcb.remote_ip,
            remote_port: tcb.remote_port,
            snd_una: tcb.snd_una,
            snd_nxt: tcb.snd_nxt,
            snd_wnd: tcb.snd_wnd,
            rcv_nxt: tcb.rcv_nxt,
            rcv_wnd: tcb.window(),
            mss: tcb.mss,
            rto: tcb.rto,
            retries: tcb.retries,
        })
    }

    /// Drena a camada IP e roda o timer se o tick avançou.
    pub fn poll(&mut self) {
        while let Some(pkt) = self.ip.poll_inbound() {
            if pkt.protocol == PROTO_TCP {
                self.handle_packet(pkt.src, &pkt.payload);
            }
        }

        let now = self.clock.ticks();
        if now != self.last_sweep {
            self.last_sweep = now;
            self.timer_tick();
        }
    }

    /// Processa um segmento TCP recebido de `src`.
    pub fn handle_packet(&mut self, src: Ipv4Addr, data: &[u8]) {
        let Some(seg) = TcpSegment::parse(data) else {
            trace!("tcp: short segment from {}", src);
            return;
        };

        if self.config.tcp.verify_checksum && !segment::verify(src, self.config.ip, data) {
            debug!("tcp: bad checksum from {}:{}", src, seg.src_port);
            return;
        }

        let matched = self.tcbs.iter().position(|t| {
            t.in_use
                && t.state != TcpState::Closed
                && t.state != TcpState::Listen
                && t.local_port == seg.dst_port
                && t.remote_port == seg.src_port
                && t.remote_ip == src
        });
        if let Some(slot) = matched {
            self.process_segment(slot, &seg);
            return;
        }

        if seg.has(TcpFlags::SYN) && !seg.has(TcpFlags::ACK) {
            let listener = self
                .tcbs
                .iter()
                .position(|t| t.in_use && t.state == TcpState::Listen && t.local_port == seg.dst_port);
            if let Some(listener) = listener {
                self.spawn_child(listener, src, &seg);
            }
        }
    }

    /// Novo SYN num socket em LISTEN: cria o filho e responde SYN+ACK.
    fn spawn_child(&mut self, listener: usize, src: Ipv4Addr, seg: &TcpSegment<'_>) {
        let Some(slot) = self.alloc(seg.dst_port, TcpState::SynReceived) else {
            debug!("tcp: no free tcb, dropping syn from {}:{}", src, seg.src_port);
            return;
        };

        let mss = self.config.tcp.mss;
        let tcb = &mut self.tcbs[slot];
        tcb.remote_ip = src;
        tcb.remote_port = seg.src_port;
        tcb.rcv_nxt = seg.seq.wrapping_add(1);
        tcb.snd_wnd = seg.window;
        if let Some(peer_mss) = seg.mss {
            tcb.mss = mss.min(peer_mss as usize);
        }
        let iss = tcb.iss;

        if let Err(e) = self.send_segment(slot, TcpFlags::SYN | TcpFlags::ACK, iss, &[]) {
            debug!("tcp: syn-ack on slot {} not sent: {}", slot, e);
        }
        self.tcbs[slot].snd_nxt = iss.wrapping_add(1);

        let child = self.id_of(slot);
        self.tcbs[listener].backlog = Some(child);
        debug!("tcp: syn from {}:{} -> slot {} (SynReceived)", src, seg.src_port, slot);
    }

    /// Aplica a máquina de estados a um segmento de uma conexão existente.
    fn process_segment(&mut self, slot: usize, seg: &TcpSegment<'_>) {
        let state = self.tcbs[slot].state;
        self.tcbs[slot].snd_wnd = seg.window;

        if seg.has(TcpFlags::RST) {
            debug!("tcp: rst on slot {} in {:?}", slot, state);
            self.set_state(slot, TcpState::Closed);
            if state == TcpState::SynReceived {
                self.tcbs[slot].release();
            }
            return;
        }

        match state {
            TcpState::SynSent => {
                if seg.has(TcpFlags::SYN | TcpFlags::ACK) {
                    let mss = self.config.tcp.mss;
                    let tcb = &mut self.tcbs[slot];
                    tcb.rcv_nxt = seg.seq.wrapping_add(1);
                    tcb.snd_una = seg.ack;
                    if let Some(peer_mss) = seg.mss {
                        tcb.mss = mss.min(peer_mss as usize);
                    }
                    self.send_ack(slot);
                    self.set_state(slot, TcpState::Established);
                }
            }
            TcpState::SynReceived => {
                if seg.has(TcpFlags::ACK) {
                    self.tcbs[slot].snd_una = seg.ack;
                    self.set_state(slot, TcpState::Established);
                }
            }
            TcpState::TimeWait => {
                // FIN atrasado: reenvia o ACK
                if seg.has(TcpFlags::FIN) {
                    self.send_ack(slot);
                }
            }
            s if s.is_synchronized() => self.process_synchronized(slot, s, seg),
            _ => {}
        }
    }

    fn process_synchronized(&mut self, slot: usize, state: TcpState, seg: &TcpSegment<'_>) {
        let tcb = &mut self.tcbs[slot];
        if seg.seq != tcb.rcv_nxt {
            trace!("tcp: slot {} dropping seq {} (expected {})", slot, seg.seq, tcb.rcv_nxt);
            return;
        }

        let fin_acked = seg.has(TcpFlags::ACK) && seg.ack == tcb.snd_nxt;
        if seg.has(TcpFlags::ACK) {
            tcb.snd_una = seg.ack;
        }

        let mut need_ack = false;
        let mut complete = true;
        let receiving = matches!(state, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2);
        if receiving && !seg.payload.is_empty() {
            let accepted = tcb.rx.write(seg.payload);
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(accepted as u32);
            complete = accepted == seg.payload.len();
            need_ack = true;
        }

        // FIN só conta se todo o payload coube no buffer
        let fin = seg.has(TcpFlags::FIN) && complete && receiving;
        if fin {
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            need_ack = true;
        }

        let next = match state {
            TcpState::Established if fin => Some(TcpState::CloseWait),
            TcpState::FinWait1 if fin_acked && fin => Some(TcpState::TimeWait),
            TcpState::FinWait1 if fin_acked => Some(TcpState::FinWait2),
            TcpState::FinWait2 if fin => Some(TcpState::TimeWait),
            TcpState::LastAck if fin_acked => Some(TcpState::Closed),
            _ => None,
        };

        if need_ack {
            self.send_ack(slot);
        }
        if let Some(next) = next {
            self.set_state(slot, next);
        }
    }

    /// Varredura periódica: expira TIME_WAIT e retransmite SYN / SYN+ACK.
    pub fn timer_tick(&mut self) {
        let now = self.clock.ticks();
        let cfg = self.config.tcp;

        for slot in 0..self.tcbs.len() {
            let tcb = &mut self.tcbs[slot];
            if !tcb.in_use {
                continue;
            }
            let elapsed = now.saturating_sub(tcb.last_send);

            match tcb.state {
                TcpState::TimeWait if elapsed > cfg.time_wait => {
                    debug!("tcp: slot {} time-wait expired", slot);
                    tcb.release();
                }
                TcpState::SynSent | TcpState::SynReceived if elapsed > tcb.rto => {
                    if tcb.retries >= cfg.max_retries {
                        debug!("tcp: slot {} gave up after {} retries", slot, tcb.retries);
                        let orphan = tcb.state == TcpState::SynReceived;
                        self.set_state(slot, TcpState::Closed);
                        if orphan {
                            self.tcbs[slot].release();
                        }
                        continue;
                    }

                    tcb.retries += 1;
                    tcb.rto *= 2;
                    let flags = match tcb.state {
                        TcpState::SynSent => TcpFlags::SYN,
                        _ => TcpFlags::SYN | TcpFlags::ACK,
                    };
                    let iss = tcb.iss;
                    debug!("tcp: slot {} retransmit {:?} (retry {}, rto {})", slot, flags, tcb.retries, tcb.rto);
                    if let Err(e) = self.send_segment(slot, flags, iss, &[]) {
                        debug!("tcp: retransmit on slot {} failed: {}", slot, e);
                    }
                }
                _ => {}
            }
        }
    }
}
