//! Crate-wide error type and `Result` extension traits.
//!
//! Mirrors the kinds enumerated by the protocol design: a wire-level failure
//! is always classifiable as one of these, so calling code can react to the
//! `ErrorKind` without downcasting a boxed error.

use std::fmt;
use std::io;

/// Wrapper result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure, independent of the underlying cause.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Unsupported protocol version, malformed frame, oversized message,
    /// or duplicate participant name.
    Protocol,
    /// Bad configuration: coordinated participant missing from the
    /// required set, conflicting registration, malformed acceptor URI.
    Configuration,
    /// Dialing a peer failed on every available path (direct,
    /// remote-connect, proxy).
    Connection,
    /// A lifecycle transition was requested that is not valid from the
    /// current state.
    State,
    /// A handshake or barrier wait exceeded its configured budget.
    Timeout,
    /// A user-supplied callback returned an error.
    Handler,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Connection => "connection error",
            ErrorKind::State => "state error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Handler => "handler error",
        };
        f.write_str(s)
    }
}

/// The error type used throughout this crate.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct Error {
    kind: ErrorKind,
    detail: Detail,
}

#[derive(Debug)]
enum Detail {
    Simple,
    Message(String),
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for Detail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detail::Simple => f.write_str("(no further detail)"),
            Detail::Message(m) => f.write_str(m),
            Detail::Wrapped(e) => write!(f, "{}", e),
        }
    }
}

impl Error {
    /// Returns a new error of kind `kind` with no further detail.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { kind, detail: Detail::Simple }
    }

    /// Returns a new error of kind `kind` with a static or owned message.
    pub fn msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error { kind, detail: Detail::Message(msg.into()) }
    }

    /// Wraps a foreign error, tagging it with `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error { kind, detail: Detail::Wrapped(e.into()) }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Connection, e)
    }
}

/// Extension of `std::result::Result`, attaching an `ErrorKind` to a
/// foreign error type while keeping the underlying cause around for
/// display and `source()`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for std::result::Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|e| Error::msg(kind, format!("{}: {}", msg, e.into())))
    }
}

/// Extension for `Option`, producing a simple (cause-less) error when
/// absent.
pub trait OptionExt {
    type T;

    fn ok_or_kind(self, kind: ErrorKind) -> Result<Self::T>;
    fn ok_or_msg(self, kind: ErrorKind, msg: impl Into<String>) -> Result<Self::T>;
}

impl<T> OptionExt for Option<T> {
    type T = T;

    fn ok_or_kind(self, kind: ErrorKind) -> Result<T> {
        self.ok_or_else(|| Error::simple(kind))
    }

    fn ok_or_msg(self, kind: ErrorKind, msg: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| Error::msg(kind, msg))
    }
}
