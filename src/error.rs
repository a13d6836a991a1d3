use bson;
use std::{error, fmt, io, result, sync};

pub type Result<T> = result::Result<T, Error>;

/// The error types used throughout this crate.
#[derive(Debug)]
pub enum Error {
    /// An invalid argument was provided by the caller.
    ArgumentError(String),
    /// An I/O failure while connecting to or talking to a server. Inside the
    /// monitoring loop this is ordinary input to the state machine; it only
    /// reaches callers when a checkout fails to open a connection.
    IoError(io::Error),
    /// The server sent a reply this crate could not make sense of.
    ResponseError(String),
    /// An operation could not be completed, usually because the client has
    /// been shut down.
    OperationError(String),
    /// A BSON encoding failure while building the handshake command.
    EncoderError(bson::EncoderError),
    /// A BSON decoding failure while reading a handshake reply.
    DecoderError(bson::DecoderError),
    /// No server in the topology supports a wire version this client speaks.
    /// Selection fails with this immediately instead of waiting out its
    /// deadline.
    CompatibilityError(String),
    /// No server matched the selection criteria before the deadline elapsed.
    SelectionTimeout {
        criterion: String,
        topology: String,
        elapsed_ms: u64,
    },
    /// The connection pool stayed at capacity for the whole checkout
    /// deadline. Retryable by the caller.
    WaitQueueTimeout {
        address: String,
        elapsed_ms: u64,
        max_size: usize,
    },
    /// A lock was poisoned by a panicking thread.
    PoisonLockError,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<bson::EncoderError> for Error {
    fn from(err: bson::EncoderError) -> Error {
        Error::EncoderError(err)
    }
}

impl From<bson::DecoderError> for Error {
    fn from(err: bson::DecoderError) -> Error {
        Error::DecoderError(err)
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::PoisonLockError
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Error::ArgumentError(ref inner) => inner.fmt(fmt),
            &Error::IoError(ref inner) => inner.fmt(fmt),
            &Error::ResponseError(ref inner) => inner.fmt(fmt),
            &Error::OperationError(ref inner) => inner.fmt(fmt),
            &Error::EncoderError(ref inner) => inner.fmt(fmt),
            &Error::DecoderError(ref inner) => inner.fmt(fmt),
            &Error::CompatibilityError(ref inner) => inner.fmt(fmt),
            &Error::SelectionTimeout { ref criterion, ref topology, elapsed_ms } => {
                write!(fmt,
                       "No server available matching {} after {} ms; topology: {}",
                       criterion, elapsed_ms, topology)
            }
            &Error::WaitQueueTimeout { ref address, elapsed_ms, max_size } => {
                write!(fmt,
                       "Connection pool for {} still at capacity ({}) after {} ms",
                       address, max_size, elapsed_ms)
            }
            &Error::PoisonLockError => write!(fmt, "Lock poisoned by a panicking thread."),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match self {
            &Error::ArgumentError(ref inner) => inner,
            &Error::IoError(ref inner) => inner.description(),
            &Error::ResponseError(ref inner) => inner,
            &Error::OperationError(ref inner) => inner,
            &Error::EncoderError(ref inner) => inner.description(),
            &Error::DecoderError(ref inner) => inner.description(),
            &Error::CompatibilityError(ref inner) => inner,
            &Error::SelectionTimeout { .. } => "No server available matching criteria",
            &Error::WaitQueueTimeout { .. } => "Connection pool at capacity",
            &Error::PoisonLockError => "Lock poisoned by a panicking thread",
        }
    }

    fn cause(&self) -> Option<&error::Error> {
        match self {
            &Error::IoError(ref inner) => Some(inner),
            &Error::EncoderError(ref inner) => Some(inner),
            &Error::DecoderError(ref inner) => Some(inner),
            _ => None,
        }
    }
}
