//! Codec de segmentos TCP (cabeçalho de 20 bytes + checksum com pseudo-header).

use alloc::vec::Vec;
use bitflags::bitflags;

use super::{Ipv4Addr, PROTO_TCP};

/// Tamanho do cabeçalho sem opções
pub const HEADER_LEN: usize = 20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;

bitflags! {
    /// Flags TCP
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Segmento TCP parseado
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    /// MSS option, se presente
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let header_len = ((data[12] >> 4) as usize) * 4;
        if header_len < HEADER_LEN || data.len() < header_len {
            return None;
        }

        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_bits_truncate(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
            mss: parse_mss_option(&data[HEADER_LEN..header_len]),
            payload: &data[header_len..],
        })
    }

    pub fn has(&self, flags: TcpFlags) -> bool {
        self.flags.contains(flags)
    }
}

fn parse_mss_option(mut opts: &[u8]) -> Option<u16> {
    while let Some(&kind) = opts.first() {
        match kind {
            OPT_END => break,
            OPT_NOP => opts = &opts[1..],
            _ => {
                let len = *opts.get(1)? as usize;
                if len < 2 || len > opts.len() {
                    return None;
                }
                if kind == OPT_MSS && len == 4 {
                    return Some(u16::from_be_bytes([opts[2], opts[3]]));
                }
                opts = &opts[len..];
            }
        }
    }
    None
}

/// Campos de um segmento a ser transmitido.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

impl SegmentHeader {
    /// Serializa cabeçalho + payload e preenche o checksum.
    pub fn build(&self, payload: &[u8], src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());

        packet.extend_from_slice(&self.src_port.to_be_bytes());
        packet.extend_from_slice(&self.dst_port.to_be_bytes());
        packet.extend_from_slice(&self.seq.to_be_bytes());
        packet.extend_from_slice(&self.ack.to_be_bytes());
        // Data offset (5 words = 20 bytes) + reserved
        packet.push(((HEADER_LEN / 4) << 4) as u8);
        packet.push(self.flags.bits());
        packet.extend_from_slice(&self.window.to_be_bytes());
        // Checksum placeholder + urgent pointer
        packet.extend_from_slice(&[0, 0, 0, 0]);
        packet.extend_from_slice(payload);

        let checksum = checksum(src_ip, dst_ip, &packet);
        packet[16..18].copy_from_slice(&checksum.to_be_bytes());
        packet
    }
}

/// Calcula checksum TCP sobre pseudo-header + segmento.
///
/// The checksum field inside `segment` must be zero. A result of 0 is sent as 0xFFFF.
pub fn checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    let folded = fold(ones_sum(src_ip, dst_ip, segment));
    match !folded {
        0 => 0xFFFF,
        sum => sum,
    }
}

/// Verifica o checksum de um segmento recebido (campo incluído).
pub fn verify(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> bool {
    // Summing over the stored checksum yields all ones when valid.
    fold(ones_sum(src_ip, dst_ip, segment)) == 0xFFFF
}

fn ones_sum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    // Pseudo-header
    let src = src_ip.0;
    let dst = dst_ip.0;
    sum += u16::from_be_bytes([src[0], src[1]]) as u32;
    sum += u16::from_be_bytes([src[2], src[3]]) as u32;
    sum += u16::from_be_bytes([dst[0], dst[1]]) as u32;
    sum += u16::from_be_bytes([dst[2], dst[3]]) as u32;
    sum += PROTO_TCP as u32;
    sum += segment.len() as u32;

    let mut words = segment.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}
