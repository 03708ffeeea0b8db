use std::{fmt, io};

/// Framing-level failures: anything that means the bytes on the wire did not
/// describe a valid message, independent of what kind of peer is talking.
#[derive(Debug)]
pub enum WireError {
    /// The declared frame length exceeded the 1 MiB hard cap from the wire spec.
    FrameTooLarge(i32),
    /// The declared length was negative, which can never be valid.
    NegativeLength(i32),
    /// A string field was not valid UTF-8.
    InvalidUtf8,
    /// A byte was read that does not correspond to any known request/response kind.
    UnknownKind(u8),
    /// The connection was closed before a complete frame could be read.
    UnexpectedEof,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FrameTooLarge(n) => write!(f, "frame length {} exceeds 1 MiB limit", n),
            Self::NegativeLength(n) => write!(f, "frame length {} is negative", n),
            Self::InvalidUtf8 => write!(f, "string field was not valid UTF-8"),
            Self::UnknownKind(b) => write!(f, "unrecognised wire kind byte {}", b),
            Self::UnexpectedEof => write!(f, "connection closed mid-frame"),
        }
    }
}

impl std::error::Error for WireError {}

/// Top-level error type returned by every public, fallible LoopCache operation.
#[derive(Debug)]
pub enum Error {
    /// Transport-level I/O failure (connect, read, write).
    Io(io::Error),
    /// A malformed frame was received.
    Wire(WireError),
    /// The peer returned a protocol response that the caller didn't ask for
    /// or that signals a failure condition (e.g. `UnknownNode`, `NodeExists`).
    Response(crate::wire::ResponseKind),
    /// A caller-supplied configuration value was invalid (e.g. non-positive capacity).
    InvalidConfiguration(String),
    /// The client exhausted its retry budget against a given request.
    RetriesExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {}", e),
            Self::Wire(e) => write!(f, "wire: {}", e),
            Self::Response(k) => write!(f, "unexpected response: {:?}", k),
            Self::InvalidConfiguration(s) => write!(f, "invalid configuration: {}", s),
            Self::RetriesExhausted => write!(f, "retry budget exhausted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Wire(e)
    }
}
