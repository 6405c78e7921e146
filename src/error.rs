//! Error types for the network abstraction layer.
//!
//! The taxonomy is flat: every public operation either succeeds or returns
//! one of the codes below. Codes are stable and enumerable so that callers
//! can branch on [`Error::code()`] across versions.

use std::fmt;
use std::io;

/// Error codes returned by NAL operations.
///
/// The `Ok` path of [`Result`] stands for code 0 (success); every variant
/// here maps to a fixed non-zero code through [`Error::code()`].
#[derive(Debug, Clone)]
pub enum Error {
    /// Operation not permitted.
    Permission,
    /// No such entry (unknown peer, region or context).
    NoEntry,
    /// Operation interrupted.
    Interrupt,
    /// Operation could not be submitted right now, retry later.
    Again,
    /// Out of memory.
    NoMem,
    /// Permission denied by the operating system.
    Access,
    /// Bad address or offset.
    Fault,
    /// Resource busy (e.g. an operation ID that is already in flight).
    Busy,
    /// Entry already exists (e.g. a context ID created twice).
    Exist,
    /// No such device.
    NoDev,
    /// Invalid argument.
    InvalidArg(String),
    /// Protocol error from the transport.
    ProtocolError(String),
    /// Output buffer too small; retry with at least `required` bytes.
    Overflow { required: usize },
    /// Message payload exceeds the transport ceiling.
    MsgSize { size: usize, max: usize },
    /// No registered plugin matches the requested protocol.
    ProtoNoSupport(String),
    /// Operation not supported on this endpoint.
    OpNotSupported,
    /// Address already in use.
    AddrInUse,
    /// Cannot assign requested address.
    AddrNotAvail,
    /// Cannot reach host.
    HostUnreach,
    /// Wait window elapsed with nothing ready. Expected steady-state outcome
    /// of a poll loop, not a failure.
    Timeout,
    /// Operation canceled. Only ever delivered through a completion callback.
    Canceled,
}

impl Error {
    /// Stable numeric code for this error. 0 is reserved for success.
    pub fn code(&self) -> u32 {
        match self {
            Error::Permission => 1,
            Error::NoEntry => 2,
            Error::Interrupt => 3,
            Error::Again => 4,
            Error::NoMem => 5,
            Error::Access => 6,
            Error::Fault => 7,
            Error::Busy => 8,
            Error::Exist => 9,
            Error::NoDev => 10,
            Error::InvalidArg(_) => 11,
            Error::ProtocolError(_) => 12,
            Error::Overflow { .. } => 13,
            Error::MsgSize { .. } => 14,
            Error::ProtoNoSupport(_) => 15,
            Error::OpNotSupported => 16,
            Error::AddrInUse => 17,
            Error::AddrNotAvail => 18,
            Error::HostUnreach => 19,
            Error::Timeout => 20,
            Error::Canceled => 21,
        }
    }

    /// Short name of the code, without per-instance detail.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Permission => "PERMISSION",
            Error::NoEntry => "NOENTRY",
            Error::Interrupt => "INTERRUPT",
            Error::Again => "AGAIN",
            Error::NoMem => "NOMEM",
            Error::Access => "ACCESS",
            Error::Fault => "FAULT",
            Error::Busy => "BUSY",
            Error::Exist => "EXIST",
            Error::NoDev => "NODEV",
            Error::InvalidArg(_) => "INVALID_ARG",
            Error::ProtocolError(_) => "PROTOCOL_ERROR",
            Error::Overflow { .. } => "OVERFLOW",
            Error::MsgSize { .. } => "MSGSIZE",
            Error::ProtoNoSupport(_) => "PROTONOSUPPORT",
            Error::OpNotSupported => "OPNOTSUPPORTED",
            Error::AddrInUse => "ADDRINUSE",
            Error::AddrNotAvail => "ADDRNOTAVAIL",
            Error::HostUnreach => "HOSTUNREACH",
            Error::Timeout => "TIMEOUT",
            Error::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Permission => write!(f, "Operation not permitted"),
            Error::NoEntry => write!(f, "No such entry"),
            Error::Interrupt => write!(f, "Operation interrupted"),
            Error::Again => write!(f, "Operation must be retried"),
            Error::NoMem => write!(f, "Out of memory"),
            Error::Access => write!(f, "Permission denied"),
            Error::Fault => write!(f, "Bad address"),
            Error::Busy => write!(f, "Resource busy"),
            Error::Exist => write!(f, "Entry already exists"),
            Error::NoDev => write!(f, "No such device"),
            Error::InvalidArg(msg) => write!(f, "Invalid argument: {}", msg),
            Error::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            Error::Overflow { required } => {
                write!(f, "Buffer too small: {} bytes required", required)
            }
            Error::MsgSize { size, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", size, max)
            }
            Error::ProtoNoSupport(proto) => {
                write!(f, "Protocol not supported: {}", proto)
            }
            Error::OpNotSupported => write!(f, "Operation not supported on endpoint"),
            Error::AddrInUse => write!(f, "Address already in use"),
            Error::AddrNotAvail => write!(f, "Cannot assign requested address"),
            Error::HostUnreach => write!(f, "Cannot reach host"),
            Error::Timeout => write!(f, "Operation reached timeout"),
            Error::Canceled => write!(f, "Operation canceled"),
        }
    }
}

impl std::error::Error for Error {}

/// Plugin-local I/O failures are converted to the nearest taxonomy code at
/// the call boundary; no raw transport error escapes the abstraction.
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Error::Access,
            io::ErrorKind::NotFound => Error::NoEntry,
            io::ErrorKind::Interrupted => Error::Interrupt,
            io::ErrorKind::WouldBlock => Error::Again,
            io::ErrorKind::OutOfMemory => Error::NoMem,
            io::ErrorKind::AddrInUse => Error::AddrInUse,
            io::ErrorKind::AddrNotAvailable => Error::AddrNotAvail,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Error::HostUnreach,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                Error::InvalidArg(e.to_string())
            }
            _ => Error::ProtocolError(e.to_string()),
        }
    }
}

/// Result type for NAL operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let all = [
            Error::Permission,
            Error::NoEntry,
            Error::Interrupt,
            Error::Again,
            Error::NoMem,
            Error::Access,
            Error::Fault,
            Error::Busy,
            Error::Exist,
            Error::NoDev,
            Error::InvalidArg("x".into()),
            Error::ProtocolError("x".into()),
            Error::Overflow { required: 1 },
            Error::MsgSize { size: 2, max: 1 },
            Error::ProtoNoSupport("x".into()),
            Error::OpNotSupported,
            Error::AddrInUse,
            Error::AddrNotAvail,
            Error::HostUnreach,
            Error::Timeout,
            Error::Canceled,
        ];
        let mut seen = std::collections::HashSet::new();
        for e in &all {
            assert!(e.code() > 0);
            assert!(seen.insert(e.code()), "duplicate code for {}", e.name());
            assert!(!e.name().is_empty());
            assert!(!e.to_string().is_empty());
        }
        assert_eq!(seen.len(), 21);
    }

    #[test]
    fn io_errors_map_into_taxonomy() {
        let e: Error = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert!(matches!(e, Error::AddrInUse));
        let e: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(e, Error::HostUnreach));
        let e: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(e, Error::Again));
    }
}
