//! Erros "kernel-level" do subsistema de rede.

use core::fmt;

/// Erros genéricos devolvidos pelas camadas TCP, TLS e HTTP.
///
/// Peer-initiated termination is never an error: reads report it as `Ok(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KError {
    /// Bad handle, wrong state for the call, or a bad argument.
    Invalid,
    /// Name resolution failed or nothing matched.
    NotFound,
    /// Connection pool exhausted.
    NoResources,
    /// Nothing to do yet; block and retry.
    WouldBlock,
    Timeout,
    NotConnected,
    ConnectionReset,
    /// Malformed or unexpected peer message.
    Protocol,
    /// Cipher suite, curve or key type this client cannot use.
    NotSupported,
    /// Record MAC or padding check failed.
    BadRecordMac,
    /// Lower layer refused to transmit.
    IO,
    /// HTTP status outside the accepted range.
    HttpStatus,
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KError::Invalid => "invalid argument or state",
            KError::NotFound => "not found",
            KError::NoResources => "no free connection slot",
            KError::WouldBlock => "operation would block",
            KError::Timeout => "timed out",
            KError::NotConnected => "not connected",
            KError::ConnectionReset => "connection reset by peer",
            KError::Protocol => "protocol violation",
            KError::NotSupported => "not supported",
            KError::BadRecordMac => "bad record mac",
            KError::IO => "i/o error",
            KError::HttpStatus => "unexpected http status",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = core::result::Result<T, KError>;
