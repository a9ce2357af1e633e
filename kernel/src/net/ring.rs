//! Ring buffer de bytes com capacidade fixa (buffer de recepção do TCB).

use alloc::vec;
use alloc::boxed::Box;

/// Fila circular de bytes. Invariante: `0 <= count <= capacity`.
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Espaço livre (vira a janela anunciada)
    pub fn free(&self) -> usize {
        self.buf.len() - self.count
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Escreve o que couber; retorna quantos bytes foram aceitos.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let cap = self.buf.len();
        for &byte in &data[..n] {
            self.buf[self.tail] = byte;
            self.tail = (self.tail + 1) % cap;
        }
        self.count += n;
        n
    }

    /// Lê até `out.len()` bytes, removendo-os da fila.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count);
        let cap = self.buf.len();
        for slot in &mut out[..n] {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.count -= n;
        n
    }

    /// Copia bytes a partir de `offset` sem consumir.
    pub fn peek(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.count {
            return 0;
        }
        let n = out.len().min(self.count - offset);
        let cap = self.buf.len();
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.buf[(self.head + offset + i) % cap];
        }
        n
    }
}
