//! A library for building QMTP servers.
//!
//! QMTP is a pipelined mail transfer protocol. A client sends a stream of
//! transactions, each made of three length-prefixed fields: the message body,
//! the envelope sender and the envelope recipients. For every recipient the
//! server answers with one field starting with `K` (accepted), `Z` (try again
//! later) or `D` (rejected).
//!
//! The library supplies the wire decoding and the per-transaction state
//! machine. The user of the library supplies the connection, a [`Queue`]
//! implementation that takes messages, and a [`DomainTable`] that decides
//! which recipients the server accepts mail for.
//!
//! # Pseudo Code
//! ```rust,ignore
//! // Configure the server once
//! let mut builder = SessionBuilder::new();
//! builder.databytes(databytes).no_local(true);
//!
//! // Create a session when a new client connects
//! let mut session = builder.build(queue, rcpthosts, reader, writer);
//!
//! // Handle transactions until the client goes away
//! let abort = session.serve();
//!
//! // Report how the connection ended
//! std::process::exit(abort.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
/// Length-prefixed field encoding.
pub mod netstring;
/// Client side decoding of server replies.
pub mod parser;
mod policy;
mod queue;
mod received;
/// Replies sent to the client.
pub mod response;
mod session;
mod wire;

pub use crate::{
    error::{Abort, AbortKind, ReplyError, EXIT_BAD_PROTOCOL, EXIT_DISCONNECT, EXIT_RESOURCES},
    policy::{
        control_lines, host_part, host_suffixes, DomainTable, Lookup, RcptHosts, RecipientStatus,
    },
    queue::{MemoryHandle, MemoryQueue, Message, Queue, QueueHandle, QueueResult},
    received::{received_header, PeerInfo},
    response::Reply,
    session::{LineEnding, Session, SessionBuilder, Summary, ADDRESS_CAPACITY, DEFAULT_TIMEOUT},
};
