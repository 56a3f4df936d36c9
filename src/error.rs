//! Error types for protonkit.
//!
//! Errors fall into a few groups that callers branch on:
//! - caller-usage sentinels (`BatchAlreadySent`, `BindMixedNamedAndNumericParams`, ...)
//! - value conversion failures (`Column`)
//! - protocol / transport failures, which poison the connection (`is_connection_fatal`)
//! - server-reported exceptions (`Exception`)
//! - pool exhaustion (`AcquireConnTimeout`)

use std::fmt;
use std::io;

use thiserror::Error;

use crate::column::ConverterError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("proton: batch has already been sent")]
    BatchAlreadySent,

    #[error("proton: streaming buffer has been closed")]
    StreamingBufferClosed,

    #[error("proton: acquire conn timeout. you can increase the number of max open conn or the dial timeout")]
    AcquireConnTimeout,

    #[error("proton: unsupported server revision")]
    UnsupportedServerRevision,

    #[error("proton [bind]: mixed named and numeric parameters")]
    BindMixedNamedAndNumericParams,

    #[error("proton [bind]: mixed positional and numeric placeholders")]
    BindMixedParamsFormats,

    #[error("proton [bind]: {0}")]
    Bind(String),

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context canceled")]
    Canceled,

    #[error("proton: unexpected end of stream")]
    UnexpectedEof,

    #[error("proton: connection is closed")]
    ConnectionClosed,

    #[error("proton: pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Exception(#[from] Exception),

    #[error(transparent)]
    Column(#[from] ConverterError),

    #[error("proton: unsupported column type \"{0}\"")]
    UnsupportedColumnType(String),

    #[error("proton [{op}]: ({column}) {message}")]
    Op {
        op: &'static str,
        column: String,
        message: String,
    },

    #[error("proton: protocol error: {0}")]
    Protocol(String),

    #[error("proton: compression error: {0}")]
    Compression(String),

    #[error("proton: configuration error: {0}")]
    Config(String),

    #[error("proton: no rows in result set")]
    NoRows,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors after which the position in the byte stream can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol(_)
                | Error::UnexpectedEof
                | Error::ConnectionClosed
                | Error::DeadlineExceeded
                | Error::Canceled
                | Error::Compression(_)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// The server exception carried by this error, if any.
    pub fn as_exception(&self) -> Option<&Exception> {
        match self {
            Error::Exception(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An exception reported by the server.
///
/// Exceptions may be chained; the first one is the outermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub nested: Option<Box<Exception>>,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: {}, message: {}", self.code, self.message)
    }
}

impl std::error::Error for Exception {}
