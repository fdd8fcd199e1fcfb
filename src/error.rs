use std::fmt;

/// A basic error type from this library.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Like a classic EAGAIN. The receiver should retry.
    Again,

    /// A generic error message.
    Msg(String),

    /// The buffer is shorter than a DNS message header. Holds the buffer length.
    TooShort(usize),

    /// A question, record or name extends past the end of the buffer.
    Truncated(String),

    /// A compression pointer is cut off, points forward or to itself, or forms a loop.
    InvalidCompressionPointer(String),

    /// A domain name that cannot be encoded, e.g. a label longer than 63 bytes.
    InvalidName(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(s) => write!(f, "{}", s),
            Error::Again => write!(f, "try again"),
            Error::TooShort(len) => write!(f, "message too short: {} bytes", len),
            Error::Truncated(s) => write!(f, "message truncated: {}", s),
            Error::InvalidCompressionPointer(s) => {
                write!(f, "invalid compression pointer: {}", s)
            }
            Error::InvalidName(s) => write!(f, "invalid domain name: {}", s),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;
