use crate::config::QueueKind;
use chrono::Utc;
use log::{debug, error};
use qmtp::{Queue, QueueHandle, QueueResult};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, PipeWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

/// Exit status of qmail-queue for a failed write
const WRITE_ERROR: i32 = 53;

// Envelope line prefixes understood by qmail-queue
fn push_address(envelope: &mut Vec<u8>, kind: u8, address: &[u8]) {
    envelope.push(kind);
    envelope.extend_from_slice(address);
    envelope.push(0);
}

//------ Backend selection -----------------------------------------------------

/// The queue configured for this server
pub enum Backend {
    Command(CommandQueue),
    Spool(SpoolQueue),
}

impl Backend {
    pub fn new(kind: &QueueKind) -> io::Result<Backend> {
        Ok(match kind {
            QueueKind::Exec(program) => Backend::Command(CommandQueue::new(program)),
            QueueKind::Spool(dir) => Backend::Spool(SpoolQueue::new(dir)?),
        })
    }
}

pub enum BackendHandle {
    Command(CommandHandle),
    Spool(SpoolHandle),
}

impl Queue for Backend {
    type Handle = BackendHandle;

    fn open(&mut self) -> io::Result<BackendHandle> {
        match self {
            Backend::Command(q) => q.open().map(BackendHandle::Command),
            Backend::Spool(q) => q.open().map(BackendHandle::Spool),
        }
    }
}

impl QueueHandle for BackendHandle {
    fn qp(&self) -> u64 {
        match self {
            BackendHandle::Command(h) => h.qp(),
            BackendHandle::Spool(h) => h.qp(),
        }
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            BackendHandle::Command(h) => h.write_body(buf),
            BackendHandle::Spool(h) => h.write_body(buf),
        }
    }

    fn fail(&mut self) {
        match self {
            BackendHandle::Command(h) => h.fail(),
            BackendHandle::Spool(h) => h.fail(),
        }
    }

    fn set_sender(&mut self, sender: &[u8]) {
        match self {
            BackendHandle::Command(h) => h.set_sender(sender),
            BackendHandle::Spool(h) => h.set_sender(sender),
        }
    }

    fn add_recipient(&mut self, recipient: &[u8]) {
        match self {
            BackendHandle::Command(h) => h.add_recipient(recipient),
            BackendHandle::Spool(h) => h.add_recipient(recipient),
        }
    }

    fn close(self) -> QueueResult {
        match self {
            BackendHandle::Command(h) => h.close(),
            BackendHandle::Spool(h) => h.close(),
        }
    }
}

//------ qmail-queue -----------------------------------------------------------

/// Runs a qmail-queue compatible program per message.
///
/// The program reads the message on descriptor 0 and the envelope on
/// descriptor 1, and reports the outcome in its exit status.
pub struct CommandQueue {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandQueue {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_owned(),
            args: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_args(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(OsString::from).collect(),
        }
    }
}

impl Queue for CommandQueue {
    type Handle = CommandHandle;

    fn open(&mut self) -> io::Result<CommandHandle> {
        let (envelope_reader, envelope_writer) = io::pipe()?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(envelope_reader)
            .stderr(Stdio::piped())
            .spawn()?;
        let body = child
            .stdin
            .take()
            .map(BufWriter::new)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "queue program has no stdin")
            })?;
        let qp = u64::from(child.id());
        debug!("started {} as qp {}", self.program.display(), qp);
        Ok(CommandHandle {
            child,
            qp,
            body: Some(body),
            envelope_writer: Some(envelope_writer),
            envelope: Vec::new(),
            failed: false,
        })
    }
}

pub struct CommandHandle {
    child: Child,
    qp: u64,
    body: Option<BufWriter<ChildStdin>>,
    envelope_writer: Option<PipeWriter>,
    envelope: Vec<u8>,
    failed: bool,
}

impl QueueHandle for CommandHandle {
    fn qp(&self) -> u64 {
        self.qp
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.failed {
            return Ok(());
        }
        match self.body.as_mut() {
            Some(body) => body.write_all(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "message already closed")),
        }
    }

    fn fail(&mut self) {
        self.failed = true;
    }

    fn set_sender(&mut self, sender: &[u8]) {
        // The body is complete once the sender is known
        if let Some(mut body) = self.body.take() {
            if let Err(e) = body.flush() {
                error!("qp {}: error writing message: {}", self.qp, e);
                self.failed = true;
            }
        }
        push_address(&mut self.envelope, b'F', sender);
    }

    fn add_recipient(&mut self, recipient: &[u8]) {
        push_address(&mut self.envelope, b'T', recipient);
    }

    fn close(mut self) -> QueueResult {
        drop(self.body.take());
        if let Some(mut writer) = self.envelope_writer.take() {
            // A failed message gets a truncated envelope, which the program refuses
            if !self.failed {
                self.envelope.push(0);
                if let Err(e) = writer.write_all(&self.envelope) {
                    error!("qp {}: error writing envelope: {}", self.qp, e);
                    self.failed = true;
                }
            }
        }
        let mut message = Vec::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ = stderr.read_to_end(&mut message);
        }
        match self.child.wait() {
            Ok(status) => match status.code() {
                Some(code) => {
                    debug!("qp {}: queue program exited with {}", self.qp, code);
                    QueueResult::from_exit_code(code, self.failed, &message, self.qp)
                }
                None => QueueResult::crashed(),
            },
            Err(e) => {
                error!("qp {}: waiting for queue program: {}", self.qp, e);
                QueueResult::InternalFault("qq waitpid surprise (#4.3.0)".into())
            }
        }
    }
}

impl Drop for CommandHandle {
    // Reap the program when a transaction is abandoned half way
    fn drop(&mut self) {
        drop(self.body.take());
        drop(self.envelope_writer.take());
        let _ = self.child.wait();
    }
}

//------ Spool directory -------------------------------------------------------

static NEXT_QP: AtomicU64 = AtomicU64::new(1);

/// Writes messages into a spool directory.
///
/// A message is written to `tmp/` and renamed into `new/` once complete, with
/// its envelope stored under the same name in `envelope/`.
pub struct SpoolQueue {
    dir: PathBuf,
}

impl SpoolQueue {
    pub fn new(dir: &Path) -> io::Result<Self> {
        for sub in ["tmp", "new", "envelope"] {
            fs::create_dir_all(dir.join(sub))?;
        }
        Ok(Self {
            dir: dir.to_owned(),
        })
    }
}

impl Queue for SpoolQueue {
    type Handle = SpoolHandle;

    fn open(&mut self) -> io::Result<SpoolHandle> {
        let qp = NEXT_QP.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}.{}.{}", Utc::now().timestamp(), std::process::id(), qp);
        let tmp = self.dir.join("tmp").join(&name);
        let file = File::create(&tmp)?;
        Ok(SpoolHandle {
            dir: self.dir.clone(),
            name,
            tmp,
            file: BufWriter::new(file),
            envelope: Vec::new(),
            qp,
            failed: false,
        })
    }
}

pub struct SpoolHandle {
    dir: PathBuf,
    name: String,
    tmp: PathBuf,
    file: BufWriter<File>,
    envelope: Vec<u8>,
    qp: u64,
    failed: bool,
}

impl SpoolHandle {
    fn envelope_tmp(&self) -> PathBuf {
        self.dir.join("tmp").join(format!("{}.envelope", self.name))
    }

    fn commit(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        let envelope_tmp = self.envelope_tmp();
        fs::write(&envelope_tmp, &self.envelope)?;
        fs::rename(&envelope_tmp, self.dir.join("envelope").join(&self.name))?;
        fs::rename(&self.tmp, self.dir.join("new").join(&self.name))
    }
}

impl QueueHandle for SpoolHandle {
    fn qp(&self) -> u64 {
        self.qp
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.failed {
            return Ok(());
        }
        self.file.write_all(buf)
    }

    fn fail(&mut self) {
        self.failed = true;
    }

    fn set_sender(&mut self, sender: &[u8]) {
        push_address(&mut self.envelope, b'F', sender);
    }

    fn add_recipient(&mut self, recipient: &[u8]) {
        push_address(&mut self.envelope, b'T', recipient);
    }

    fn close(mut self) -> QueueResult {
        if self.failed {
            return QueueResult::failed();
        }
        match self.commit() {
            Ok(()) => QueueResult::accepted(self.qp),
            Err(e) => {
                error!("qp {}: unable to spool message: {}", self.qp, e);
                QueueResult::from_exit_code(WRITE_ERROR, false, &[], self.qp)
            }
        }
    }
}

impl Drop for SpoolHandle {
    // Nothing is left in tmp/ once the handle is gone
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.tmp);
        let _ = fs::remove_file(self.envelope_tmp());
    }
}
