//! Error taxonomy for the shuffle transport.
//!
//! Small, concern-scoped enums rather than one crate-wide error, matching
//! `t51core::net::error`/`t51core::net::result`. Each carries only the variants its
//! own callers need to match on; `Error` at the bottom aggregates them for the two
//! binaries and for top-level engine methods.

use std::io;

/// Errors from parsing or encoding wire messages (§4.8, §7 "Malformed request" /
/// "Oversize message").
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    /// A required ':'-separated field was missing or empty.
    MissingField { field: &'static str },
    /// A field that should have parsed as an integer did not.
    InvalidInteger { field: &'static str },
    /// The path exceeded `NETLEV_MOF_PATH_MAX_SIZE`.
    PathTooLong,
    /// The encoded payload would exceed `NETLEV_FETCH_REQSIZE`.
    OversizeRequest,
    /// The header declared a message type this build does not understand.
    UnknownMessageType(u8),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::MissingField { field } => write!(f, "missing field `{}`", field),
            WireError::InvalidInteger { field } => write!(f, "invalid integer in field `{}`", field),
            WireError::PathTooLong => write!(f, "mof path exceeds NETLEV_MOF_PATH_MAX_SIZE"),
            WireError::OversizeRequest => write!(f, "encoded payload exceeds NETLEV_FETCH_REQSIZE"),
            WireError::UnknownMessageType(t) => write!(f, "unknown message type {}", t),
        }
    }
}

/// Errors from connection lifecycle and completion dispatch (§4.3, §7).
#[derive(Debug)]
pub enum ConnectionError {
    /// CM handshake saw an event it didn't expect for its current phase.
    UnexpectedCmEvent(&'static str),
    /// Retries exhausted during `connect()`.
    ConnectRetriesExhausted,
    /// No device could be resolved for the peer's route.
    DeviceUnavailable,
    /// The connection is `BAD` and cannot accept new sends.
    ConnectionBad,
    /// A completion reported a non-FLUSH error.
    CompletionError { status: i32 },
    Io(io::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::UnexpectedCmEvent(ctx) => write!(f, "unexpected CM event during {}", ctx),
            ConnectionError::ConnectRetriesExhausted => write!(f, "exhausted connect retries"),
            ConnectionError::DeviceUnavailable => write!(f, "no device available for route"),
            ConnectionError::ConnectionBad => write!(f, "connection is BAD"),
            ConnectionError::CompletionError { status } => write!(f, "completion error, status {}", status),
            ConnectionError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

/// Errors from buffer pool registration and acquisition (§4.5, §7).
#[derive(Debug, Eq, PartialEq)]
pub enum PoolError {
    /// Pair size failed minimum size or page alignment checks at init.
    InvalidPairSize,
    /// Memory registration with a device failed.
    RegistrationFailed,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::InvalidPairSize => write!(f, "pair size fails minimum size/alignment checks"),
            PoolError::RegistrationFailed => write!(f, "memory registration failed"),
        }
    }
}

/// Top-level error aggregating the concern-scoped errors above, used by engine-facing
/// APIs (`issue_fetch`, `connect`, the two binaries) that cross more than one concern.
#[derive(Debug)]
pub enum Error {
    Wire(WireError),
    Connection(ConnectionError),
    Pool(PoolError),
    Config(serdeconv::Error),
    Io(io::Error),
    /// A caller-supplied argument failed a precondition check, e.g. `issue_fetch`
    /// with `buf_len == 0` (§4.6 step 1).
    InvalidArgument(&'static str),
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Wire(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Error::Pool(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serdeconv::Error> for Error {
    fn from(e: serdeconv::Error) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Wire(e) => write!(f, "{}", e),
            Error::Connection(e) => write!(f, "{}", e),
            Error::Pool(e) => write!(f, "{}", e),
            Error::Config(e) => write!(f, "config error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
