use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::Abort;
use crate::netstring::{decode_comma, decode_field, decode_length, decode_nested_length, Field};
use crate::policy::{DomainTable, RecipientPolicy, RecipientStatus, Verdict};
use crate::queue::{Queue, QueueHandle};
use crate::received::{received_header, PeerInfo};
use crate::response::Reply;
use crate::wire::Wire;
use chrono::Utc;
use log::{debug, error, info, trace};

/// Size of the buffer holding a sender or recipient address.
///
/// Fields at least this long are drained from the connection and treated as
/// malformed.
pub const ADDRESS_CAPACITY: u64 = 1000;

/// Default time budget for a whole connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

//------ Types -----------------------------------------------------------------

/// How the client encoded line endings in the message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// Lines end in LF; the body is copied as is
    Lf,
    /// Lines end in CR LF; each pair is stored as a single LF
    CrLf,
}

impl LineEnding {
    fn from_selector(ch: u8) -> Result<Self, Abort> {
        match ch {
            b'\n' => Ok(LineEnding::Lf),
            b'\r' => Ok(LineEnding::CrLf),
            _ => Err(Abort::Protocol("bad line ending selector")),
        }
    }
}

/// What one transaction did, for logging by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Queue identifier of the handle used
    pub qp: u64,
    /// Body bytes read from the client, excluding the selector
    pub body_len: u64,
    /// Number of recipients decoded
    pub recipients: usize,
    /// Number of recipients passed to the queue
    pub accepted: usize,
    /// The reply sent to the client
    pub reply: Reply,
}

#[derive(Clone)]
/// Builds a QMTP `Session`
///
/// # Examples
/// ```
/// # use qmtp::{SessionBuilder, MemoryQueue, RcptHosts};
/// # use std::sync::mpsc;
/// let (tx, rx) = mpsc::channel();
/// let mut rcpthosts = RcptHosts::new();
/// rcpthosts.add_host("example.com");
///
/// // Create a session builder that holds the configuration
/// let mut builder = SessionBuilder::new();
/// builder.databytes(10_000_000).no_local(true);
///
/// // Then when a client connects
/// let input: &[u8] = b"6:\nhello,3:a@b,17:13:c@example.com,,";
/// let mut output = Vec::new();
/// let mut session = builder.build(MemoryQueue::new(tx), rcpthosts, input, &mut output);
/// session.serve();
/// # drop(session);
/// assert_eq!(rx.recv().unwrap().body, b"hello");
/// ```
pub struct SessionBuilder {
    databytes: u64,
    policy: RecipientPolicy,
    peer: Option<PeerInfo>,
    timeout: Option<Duration>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Create a builder with no size limit and no connection timeout
    pub fn new() -> Self {
        Self {
            databytes: 0,
            policy: RecipientPolicy::default(),
            peer: None,
            timeout: None,
        }
    }

    /// Limit message bodies to `databytes` bytes; 0 means unlimited
    pub fn databytes(&mut self, databytes: u64) -> &mut Self {
        self.databytes = databytes;
        self
    }

    /// Trust the client to relay: skip domain checks and append `annotation`
    /// to every recipient
    pub fn relay_client<S: Into<Vec<u8>>>(&mut self, annotation: S) -> &mut Self {
        self.policy.relay_client = Some(annotation.into());
        self
    }

    /// Reject recipients in domains that are delivered locally
    pub fn no_local(&mut self, no_local: bool) -> &mut Self {
        self.policy.disallow_local = no_local;
        self
    }

    /// Prepend a `Received:` header describing `peer` to every message
    pub fn peer(&mut self, peer: PeerInfo) -> &mut Self {
        self.peer = Some(peer);
        self
    }

    /// Abandon the connection once it has been open for `timeout`
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build a session for one client connection
    pub fn build<Q, D, R, W>(&self, queue: Q, table: D, input: R, output: W) -> Session<Q, D, R, W>
    where
        Q: Queue,
        D: DomainTable,
        R: Read,
        W: Write,
    {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        Session {
            databytes: self.databytes,
            policy: self.policy.clone(),
            peer: self.peer.clone(),
            queue,
            table,
            wire: Wire::new(input, output, deadline),
        }
    }
}

/// A single QMTP connection.
///
/// Transactions are handled one after the other until the client goes away or
/// breaks the protocol.
pub struct Session<Q, D, R: Read, W: Write> {
    databytes: u64,
    policy: RecipientPolicy,
    peer: Option<PeerInfo>,
    queue: Q,
    table: D,
    wire: Wire<R, W>,
}

// State of the message currently being received
struct Transaction<H> {
    handle: H,
    // Bytes the handle may still take before the message is too big
    remaining: Option<u64>,
    overflowed: bool,
    failed: bool,
    sender_malformed: bool,
    statuses: Vec<RecipientStatus>,
    accepted: usize,
}

impl<H: QueueHandle> Transaction<H> {
    fn new(handle: H, databytes: u64) -> Self {
        Self {
            handle,
            remaining: match databytes {
                0 => None,
                n => Some(n.saturating_add(1)),
            },
            overflowed: false,
            failed: false,
            sender_malformed: false,
            statuses: Vec::new(),
            accepted: 0,
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.handle.fail();
    }

    // Pass body bytes on to the queue, counting them against the size limit
    fn put(&mut self, buf: &[u8]) {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(buf.len() as u64);
                if *remaining == 0 {
                    debug!("qp {}: message exceeds size limit", self.handle.qp());
                    self.overflowed = true;
                    self.fail();
                }
            }
        }
        if self.failed {
            return;
        }
        if let Err(e) = self.handle.write_body(buf) {
            error!("Error saving message: {}", e);
            self.fail();
        }
    }
}

// Collapses CR LF into LF across chunk boundaries
#[derive(Default)]
struct CrLf {
    pending_cr: bool,
}

impl CrLf {
    fn translate(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &ch in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if ch == b'\n' {
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\r');
            }
            if ch == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(ch);
            }
        }
    }

    // A CR at the very end of the body is kept
    fn finish(self, out: &mut Vec<u8>) {
        if self.pending_cr {
            out.push(b'\r');
        }
    }
}

impl<Q, D, R, W> Session<Q, D, R, W>
where
    Q: Queue,
    D: DomainTable,
    R: Read,
    W: Write,
{
    /// Handle transactions until the connection ends, and return why it ended.
    ///
    /// [`Abort::Disconnected`] is the normal way for a session to finish.
    pub fn serve(&mut self) -> Abort {
        loop {
            match self.transaction() {
                Ok(summary) => info!(
                    "qp {}: {} bytes, {}/{} recipients accepted: {}",
                    summary.qp,
                    summary.body_len,
                    summary.accepted,
                    summary.recipients,
                    summary.reply.status
                ),
                Err(abort) => {
                    // Deliver replies still sitting in the buffer
                    let _ = self.wire.flush();
                    return abort;
                }
            }
        }
    }

    /// Receive one transaction and queue the reply for sending.
    ///
    /// The reply is only pushed to the client when the session next waits for
    /// input, or when [`Session::serve`] returns.
    pub fn transaction(&mut self) -> Result<Summary, Abort> {
        // AwaitBody
        let body_len = decode_length(&mut self.wire)?;
        if body_len == 0 {
            return Err(Abort::Protocol("empty body field"));
        }
        let handle = self.queue.open().map_err(Abort::QueueUnavailable)?;
        let qp = handle.qp();
        let mut txn = Transaction::new(handle, self.databytes);
        let mode = LineEnding::from_selector(self.wire.read_byte()?)?;
        trace!("> qp {}: body of {} bytes, {:?}", qp, body_len - 1, mode);

        if let Some(peer) = &self.peer {
            let header = received_header(peer, Utc::now());
            if let Err(e) = txn.handle.write_body(header.as_bytes()) {
                error!("Error saving message: {}", e);
                txn.fail();
            }
        }

        // StreamingBody
        self.stream_body(&mut txn, body_len - 1, mode)?;
        decode_comma(&mut self.wire)?;

        // AwaitSender
        self.sender(&mut txn)?;

        // AwaitRecipientEnvelope, PerRecipient
        self.recipients(&mut txn)?;

        // AwaitTrailingComma
        decode_comma(&mut self.wire)?;

        // Responding
        if txn.accepted == 0 {
            txn.fail();
        }
        let Transaction {
            handle,
            overflowed,
            sender_malformed,
            statuses,
            accepted,
            ..
        } = txn;
        let result = handle.close();
        let size_exceeded = self.databytes > 0 && overflowed;
        let reply = Reply::new(&result, sender_malformed, size_exceeded, &statuses);
        reply.log();
        self.wire.write(&reply.encoded)?;

        Ok(Summary {
            qp,
            body_len: body_len - 1,
            recipients: statuses.len(),
            accepted,
            reply,
        })
    }

    fn stream_body(
        &mut self,
        txn: &mut Transaction<Q::Handle>,
        len: u64,
        mode: LineEnding,
    ) -> Result<(), Abort> {
        match mode {
            LineEnding::Lf => self.wire.stream(len, |chunk| txn.put(chunk)),
            LineEnding::CrLf => {
                let mut crlf = CrLf::default();
                let mut out = Vec::new();
                self.wire.stream(len, |chunk| {
                    out.clear();
                    crlf.translate(chunk, &mut out);
                    txn.put(&out);
                })?;
                out.clear();
                crlf.finish(&mut out);
                if !out.is_empty() {
                    txn.put(&out);
                }
                Ok(())
            }
        }
    }

    fn sender(&mut self, txn: &mut Transaction<Q::Handle>) -> Result<(), Abort> {
        let sender = match decode_field(&mut self.wire, ADDRESS_CAPACITY)? {
            Field::Kept(sender) => sender,
            Field::Oversized(len) => {
                debug!("sender of {} bytes discarded", len);
                txn.sender_malformed = true;
                Vec::new()
            }
        };
        trace!("> sender {}", String::from_utf8_lossy(&sender));
        let sender = match sender.iter().position(|&b| b == 0) {
            Some(nul) => {
                txn.sender_malformed = true;
                &sender[..nul]
            }
            None => &sender[..],
        };
        txn.handle.set_sender(sender);
        if txn.sender_malformed {
            txn.fail();
        }
        Ok(())
    }

    fn recipients(&mut self, txn: &mut Transaction<Q::Handle>) -> Result<(), Abort> {
        let mut budget = decode_length(&mut self.wire)?;
        while budget > 0 {
            let len = decode_nested_length(&mut self.wire, &mut budget)?;
            if len >= budget {
                return Err(Abort::Protocol("recipient runs past end of recipient list"));
            }
            let status = self.recipient(txn, len)?;
            txn.statuses.push(status);
            decode_comma(&mut self.wire)?;
            budget -= len + 1;
        }
        Ok(())
    }

    // Read one recipient address of `len` bytes and decide what to do with it
    fn recipient(
        &mut self,
        txn: &mut Transaction<Q::Handle>,
        len: u64,
    ) -> Result<RecipientStatus, Abort> {
        if len + self.policy.annotation_len() >= ADDRESS_CAPACITY {
            debug!("recipient of {} bytes discarded", len);
            self.wire.drain(len)?;
            return Ok(RecipientStatus::Oversized);
        }
        let address = self.wire.read_exact(len)?;
        trace!("> recipient {}", String::from_utf8_lossy(&address));
        if address.contains(&0) {
            return Ok(RecipientStatus::Malformed);
        }
        match self.policy.evaluate(&self.table, &address)? {
            Verdict::Accept(forward) => {
                txn.handle.add_recipient(&forward);
                txn.accepted += 1;
                Ok(RecipientStatus::Accepted)
            }
            Verdict::Reject => {
                debug!("recipient {} rejected", String::from_utf8_lossy(&address));
                Ok(RecipientStatus::DomainRejected)
            }
        }
    }
}

//----- Tests ------------------------------------------------------------------
