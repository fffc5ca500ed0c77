//! Connection-level failures

use std::io;
use thiserror::Error;

/// Exit status for a connection that ended without a protocol error
pub const EXIT_DISCONNECT: i32 = 0;
/// Exit status for malformed framing from the client
pub const EXIT_BAD_PROTOCOL: i32 = 100;
/// Exit status for exhausted resources: oversized lengths, timeouts, broken collaborators
pub const EXIT_RESOURCES: i32 = 111;

/// The reason a connection was abandoned.
///
/// Every variant is fatal to the connection. Problems that only affect a single
/// field (an oversized sender, a rejected recipient) are never reported as an
/// `Abort`, they end up in the reply instead.
#[derive(Error, Debug)]
pub enum Abort {
    /// The client went away, or a read or write on the connection failed
    #[error("connection closed")]
    Disconnected,

    /// The client broke the framing rules
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A length prefix grew beyond `netstring::MAX_LENGTH`
    #[error("length prefix exceeds {max}", max = crate::netstring::MAX_LENGTH)]
    LengthOverflow,

    /// The domain table could not be consulted
    #[error("domain table lookup failed: {0}")]
    LookupFailed(String),

    /// The connection used up its time budget
    #[error("connection time budget exhausted")]
    Timeout,

    /// The queue refused to open a new handle
    #[error("unable to open queue: {0}")]
    QueueUnavailable(#[source] io::Error),
}

/// Coarse classification of an [`Abort`], used for exit statuses and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Nothing to report
    Disconnect,
    /// The client sent something that is not QMTP
    ProtocolViolation,
    /// The server ran out of something
    Resources,
}

impl Abort {
    /// Map an I/O error on the client connection.
    ///
    /// Read timeouts count against the connection budget, everything else is a
    /// plain disconnect.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Abort::Timeout,
            _ => {
                log::debug!("connection i/o error: {}", err);
                Abort::Disconnected
            }
        }
    }

    /// Classify the abort
    pub fn kind(&self) -> AbortKind {
        match self {
            Abort::Disconnected => AbortKind::Disconnect,
            Abort::Protocol(_) => AbortKind::ProtocolViolation,
            Abort::LengthOverflow
            | Abort::LookupFailed(_)
            | Abort::Timeout
            | Abort::QueueUnavailable(_) => AbortKind::Resources,
        }
    }

    /// The process exit status for a server handling a single connection
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            AbortKind::Disconnect => EXIT_DISCONNECT,
            AbortKind::ProtocolViolation => EXIT_BAD_PROTOCOL,
            AbortKind::Resources => EXIT_RESOURCES,
        }
    }
}

/// A reply stream that could not be decoded
#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed reply at byte {offset}")]
pub struct ReplyError {
    /// Offset of the first byte that could not be parsed
    pub offset: usize,
}
