//! Network transport core do kernel.
//!
//! Implementa:
//! - TCP (Layer 4): TCB arena, máquina de estados, retransmissão
//! - TLS 1.2 client (ECDHE-RSA / RSA com AES-128-CBC-SHA256)
//! - HTTP/1.0 e HTTPS GET
//!
//! The IP layer below is reached only through [`IpLayer`].

pub mod http;
pub mod https;
pub mod ring;
pub mod segment;
pub mod socket;
pub mod tcp;
pub mod tls;

use alloc::vec::Vec;

use crate::util::KResult;

/// Número de protocolo IP do TCP
pub const PROTO_TCP: u8 = 6;

/// Configuração de rede
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub ip: Ipv4Addr,
    pub tcp: TcpConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::new(10, 0, 2, 15), // QEMU user mode default
            tcp: TcpConfig::default(),
        }
    }
}

/// Parâmetros do engine TCP. Tempos em ticks de `time::TIMER_HZ`.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Tamanho fixo da tabela de TCBs
    pub max_connections: usize,
    /// Capacidade do ring buffer de recepção
    pub buffer_size: usize,
    pub mss: usize,
    pub max_retries: u32,
    pub rto_initial: u64,
    pub time_wait: u64,
    pub connect_timeout: u64,
    pub close_timeout: u64,
    pub ephemeral_port_base: u16,
    /// Drop inbound segments whose checksum does not verify.
    pub verify_checksum: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            buffer_size: 4096,
            mss: 1400,
            max_retries: 5,
            rto_initial: 100,
            time_wait: 600,
            connect_timeout: 500,
            close_timeout: 300,
            ephemeral_port_base: 49152,
            verify_checksum: true,
        }
    }
}

/// Endereço IPv4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Datagrama IP entregue à camada de transporte.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub src: Ipv4Addr,
    pub protocol: u8,
    pub payload: Vec<u8>,
}

/// Camada IP abaixo do TCP.
pub trait IpLayer {
    /// Transmit one transport payload to `dst`.
    fn send_packet(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> KResult<()>;

    /// Next datagram received from the NIC, if any.
    fn poll_inbound(&mut self) -> Option<Inbound>;
}
