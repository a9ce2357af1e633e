//! Socket-style byte streams.
//!
//! [`Transport`] is the seam TLS and HTTP read and write through;
//! [`TcpStream`] implements it over one connection of a [`TcpStack`].

use log::debug;

use super::tcp::{ConnId, TcpStack};
use super::{IpLayer, Ipv4Addr};
use crate::time::Clock;
use crate::util::{KError, KResult};

/// Stream bloqueante de bytes.
pub trait Transport {
    /// Sends all of `data` or fails.
    fn send(&mut self, data: &[u8]) -> KResult<usize>;

    /// Reads at least one byte, or `Ok(0)` at end of stream.
    fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> KResult<usize>;

    /// Fill `buf` completely. `Ok(false)` when the stream ended before the first byte.
    fn recv_exact(&mut self, buf: &mut [u8], timeout_ms: u32) -> KResult<bool> {
        let mut got = 0;
        while got < buf.len() {
            match self.recv(&mut buf[got..], timeout_ms)? {
                0 if got == 0 => return Ok(false),
                0 => return Err(KError::ConnectionReset),
                n => got += n,
            }
        }
        Ok(true)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8]) -> KResult<usize> {
        (**self).send(data)
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> KResult<usize> {
        (**self).recv(buf, timeout_ms)
    }
}

/// Conexão TCP ativa emprestada do stack. Fecha no drop.
pub struct TcpStream<'a, I: IpLayer, C: Clock> {
    stack: &'a mut TcpStack<I, C>,
    id: ConnId,
    open: bool,
}

impl<'a, I: IpLayer, C: Clock> TcpStream<'a, I, C> {
    /// Abre um TCB efêmero e conecta.
    pub fn connect(stack: &'a mut TcpStack<I, C>, ip: Ipv4Addr, port: u16) -> KResult<Self> {
        let id = stack.open(0, false)?;
        if let Err(e) = stack.connect(id, ip, port) {
            if let Err(close_err) = stack.close(id) {
                debug!("tcp: close after failed connect: {}", close_err);
            }
            return Err(e);
        }
        Ok(Self { stack, id, open: true })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Fecha explicitamente (FIN + espera best-effort).
    pub fn close(mut self) -> KResult<()> {
        self.open = false;
        self.stack.close(self.id)
    }
}

impl<'a, I: IpLayer, C: Clock> Transport for TcpStream<'a, I, C> {
    fn send(&mut self, data: &[u8]) -> KResult<usize> {
        self.stack.send(self.id, data)
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> KResult<usize> {
        self.stack.recv(self.id, buf, timeout_ms)
    }
}

impl<'a, I: IpLayer, C: Clock> Drop for TcpStream<'a, I, C> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.stack.close(self.id) {
                debug!("tcp: close on drop failed: {}", e);
            }
        }
    }
}
