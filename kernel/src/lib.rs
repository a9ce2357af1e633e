//! Stenzel OS network transport core.
//!
//! - `net::tcp`: connection engine (TCB arena, state machine, timers)
//! - `net::tls`: TLS 1.2 client (record layer, handshake, PRF)
//! - `net::http` / `net::https`: HTTP/1.0 GET wrappers
//! - `crypto`: facade over the primitives the TLS client consumes

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod util;

pub mod crypto;
pub mod net;
pub mod sync;
pub mod time;

#[cfg(test)]
mod testutil;

pub use util::{KError, KResult};
