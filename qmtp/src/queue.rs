//! The collaborator that durably accepts messages

use chrono::Utc;
use std::borrow::Cow;
use std::io;
use std::sync::mpsc;

/// Opens one [`QueueHandle`] per transaction.
pub trait Queue {
    /// The handle type for a single message
    type Handle: QueueHandle;

    /// Start a new message
    fn open(&mut self) -> io::Result<Self::Handle>;
}

impl<Q: Queue + ?Sized> Queue for &mut Q {
    type Handle = Q::Handle;

    fn open(&mut self) -> io::Result<Self::Handle> {
        (**self).open()
    }
}

/// A single message on its way into the queue.
///
/// Calls arrive in order: body writes, one `set_sender`, zero or more
/// `add_recipient`, then `close`. `fail` may be called at any point and means
/// the message must not be queued; later writes are silently dropped.
pub trait QueueHandle {
    /// Identifier reported to the client on success
    fn qp(&self) -> u64;

    /// Append message bytes
    fn write_body(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Make sure the message is not queued
    fn fail(&mut self);

    /// Set the envelope sender; the body is complete once this is called
    fn set_sender(&mut self, sender: &[u8]);

    /// Add an envelope recipient
    fn add_recipient(&mut self, recipient: &[u8]);

    /// Finish the message and report what happened to it
    fn close(self) -> QueueResult;
}

/// Outcome of closing a [`QueueHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueResult {
    /// The message is queued
    Accepted {
        /// Unix time at which the queue took the message
        timestamp: i64,
        /// Queue identifier
        qp: u64,
    },
    /// Try again later (4.x.x)
    TemporaryFailure(Cow<'static, str>),
    /// Do not try again (5.x.x)
    PermanentFailure(Cow<'static, str>),
    /// The queue misbehaved; reported to the client as a temporary failure
    InternalFault(Cow<'static, str>),
}

const READ_ERROR: &str = "qq read error (#4.3.0)";

impl QueueResult {
    /// The message was queued just now
    pub fn accepted(qp: u64) -> Self {
        QueueResult::Accepted {
            timestamp: Utc::now().timestamp(),
            qp,
        }
    }

    /// Interpret the exit status of a qmail-queue compatible program.
    ///
    /// `failed` is set when the handle was failed or hit a write error, which
    /// turns a clean exit into a read error. `message` is the text the program
    /// reported itself, used only for exit status 82.
    pub fn from_exit_code(code: i32, failed: bool, message: &[u8], qp: u64) -> Self {
        use QueueResult::*;
        match code {
            0 if !failed => QueueResult::accepted(qp),
            11 | 115 => PermanentFailure("envelope address too long for qq (#5.1.3)".into()),
            31 => PermanentFailure("mail server permanently rejected message (#5.3.0)".into()),
            51 => TemporaryFailure("qq out of memory (#4.3.0)".into()),
            52 => TemporaryFailure("qq timeout (#4.3.0)".into()),
            53 => TemporaryFailure("qq write error or disk full (#4.3.0)".into()),
            0 | 54 => TemporaryFailure(READ_ERROR.into()),
            55 => TemporaryFailure("qq unable to read configuration (#4.3.0)".into()),
            56 => TemporaryFailure("qq trouble making network connection (#4.3.0)".into()),
            61 => TemporaryFailure("qq trouble in home directory (#4.3.0)".into()),
            62..=66 => TemporaryFailure("qq trouble creating files in queue (#4.3.0)".into()),
            71 => TemporaryFailure("mail server temporarily rejected message (#4.3.0)".into()),
            72 => TemporaryFailure("connection to mail server timed out (#4.4.1)".into()),
            73 => TemporaryFailure("connection to mail server rejected (#4.4.1)".into()),
            74 => TemporaryFailure("communication with mail server failed (#4.4.2)".into()),
            81 | 91 => InternalFault("qq internal bug (#4.3.0)".into()),
            120 => InternalFault("unable to exec qq (#4.3.0)".into()),
            82 if message.len() > 2 => QueueResult::from_line(message),
            11..=40 => PermanentFailure("qq permanent problem (#5.3.0)".into()),
            _ => TemporaryFailure("qq temporary problem (#4.3.0)".into()),
        }
    }

    /// The queue program died from a signal
    pub fn crashed() -> Self {
        QueueResult::InternalFault("qq crashed (#4.3.0)".into())
    }

    /// The failure a handle reports after `fail` was called
    pub fn failed() -> Self {
        QueueResult::TemporaryFailure(READ_ERROR.into())
    }

    // Classify a status line reported by the queue program itself
    fn from_line(line: &[u8]) -> Self {
        let text = String::from_utf8_lossy(&line[1..]).trim_end().to_owned();
        match line[0] {
            b'D' => QueueResult::PermanentFailure(text.into()),
            _ => QueueResult::TemporaryFailure(text.into()),
        }
    }

    /// Is this a success?
    pub fn is_accepted(&self) -> bool {
        matches!(self, QueueResult::Accepted { .. })
    }

    /// The status line as sent to the client: `K`, `Z` or `D` followed by text
    pub fn line(&self) -> String {
        match self {
            QueueResult::Accepted { timestamp, qp } => format!("Kok {} qp {}", timestamp, qp),
            QueueResult::TemporaryFailure(reason) | QueueResult::InternalFault(reason) => {
                format!("Z{}", reason)
            }
            QueueResult::PermanentFailure(reason) => format!("D{}", reason),
        }
    }
}

/// A message delivered by [`MemoryQueue`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Queue identifier
    pub qp: u64,
    /// Envelope sender
    pub sender: Vec<u8>,
    /// Envelope recipients, in the order they were accepted
    pub recipients: Vec<Vec<u8>>,
    /// Message content including any trace header
    pub body: Vec<u8>,
}

/// A queue that hands complete messages to a channel.
///
/// Useful for embedding the server in tests; nothing is persisted.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    tx: mpsc::Sender<Message>,
    next_qp: u64,
}

impl MemoryQueue {
    /// Create a queue delivering into `tx`
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx, next_qp: 1 }
    }
}

impl Queue for MemoryQueue {
    type Handle = MemoryHandle;

    fn open(&mut self) -> io::Result<MemoryHandle> {
        let qp = self.next_qp;
        self.next_qp += 1;
        Ok(MemoryHandle {
            tx: self.tx.clone(),
            message: Message {
                qp,
                ..Message::default()
            },
            failed: false,
        })
    }
}

/// Handle for [`MemoryQueue`]
#[derive(Debug)]
pub struct MemoryHandle {
    tx: mpsc::Sender<Message>,
    message: Message,
    failed: bool,
}

impl QueueHandle for MemoryHandle {
    fn qp(&self) -> u64 {
        self.message.qp
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.failed {
            self.message.body.extend_from_slice(buf);
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.failed = true;
    }

    fn set_sender(&mut self, sender: &[u8]) {
        self.message.sender = sender.to_vec();
    }

    fn add_recipient(&mut self, recipient: &[u8]) {
        self.message.recipients.push(recipient.to_vec());
    }

    fn close(self) -> QueueResult {
        if self.failed {
            return QueueResult::failed();
        }
        let qp = self.message.qp;
        match self.tx.send(self.message) {
            Ok(()) => QueueResult::accepted(qp),
            Err(_) => QueueResult::from_exit_code(53, false, &[], qp),
        }
    }
}
