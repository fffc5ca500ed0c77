use crate::error::Abort;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::time::Instant;

/// Buffered client connection.
///
/// Replies are collected in the output buffer and only pushed to the client
/// when the input buffer runs dry, so a pipelining client receives a batch of
/// replies exactly when the server would otherwise block waiting for it.
pub(crate) struct Wire<R: Read, W: Write> {
    input: BufReader<R>,
    output: BufWriter<W>,
    deadline: Option<Instant>,
}

impl<R: Read, W: Write> Wire<R, W> {
    pub fn new(input: R, output: W, deadline: Option<Instant>) -> Self {
        Self {
            input: BufReader::new(input),
            output: BufWriter::new(output),
            deadline,
        }
    }

    // Return buffered input, refilling from the client when empty
    fn fill(&mut self) -> Result<&[u8], Abort> {
        if self.input.buffer().is_empty() {
            self.output.flush().map_err(Abort::from_io)?;
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(Abort::Timeout);
                }
            }
        }
        let buf = self.input.fill_buf().map_err(Abort::from_io)?;
        if buf.is_empty() {
            return Err(Abort::Disconnected);
        }
        Ok(buf)
    }

    pub fn read_byte(&mut self) -> Result<u8, Abort> {
        let ch = self.fill()?[0];
        self.input.consume(1);
        Ok(ch)
    }

    pub fn read_exact(&mut self, len: u64) -> Result<Vec<u8>, Abort> {
        let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0).min(4096));
        self.stream(len, |chunk| out.extend_from_slice(chunk))?;
        Ok(out)
    }

    /// Consume exactly `len` bytes without looking at them
    pub fn drain(&mut self, len: u64) -> Result<(), Abort> {
        self.stream(len, |_| ())
    }

    /// Pass the next `len` bytes to `sink`, one buffered chunk at a time
    pub fn stream<F>(&mut self, mut len: u64, mut sink: F) -> Result<(), Abort>
    where
        F: FnMut(&[u8]),
    {
        while len > 0 {
            let buf = self.fill()?;
            let take = buf.len().min(usize::try_from(len).unwrap_or(usize::MAX));
            sink(&buf[..take]);
            self.input.consume(take);
            len -= take as u64;
        }
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<(), Abort> {
        self.output.write_all(buf).map_err(Abort::from_io)
    }

    pub fn flush(&mut self) -> Result<(), Abort> {
        self.output.flush().map_err(Abort::from_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    #[test]
    fn short_read_disconnects() {
        let mut out = Vec::new();
        let mut wire = Wire::new(&b"abc"[..], &mut out, None);
        assert_eq!(wire.read_byte().unwrap(), b'a');
        assert!(matches!(wire.read_exact(5), Err(Abort::Disconnected)));
    }

    #[test]
    fn drain_is_exact() {
        let mut out = Vec::new();
        let mut wire = Wire::new(&b"0123456789"[..], &mut out, None);
        wire.drain(7).unwrap();
        assert_eq!(wire.read_exact(3).unwrap(), b"789");
    }

    // Hands out one byte per read so that every byte needs a refill
    struct Trickle<'a> {
        data: &'a [u8],
        log: &'a std::cell::RefCell<Vec<usize>>,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[0];
            self.data = &self.data[1..];
            self.log.borrow_mut().push(self.data.len());
            Ok(1)
        }
    }

    struct Recorder<'a> {
        written: &'a std::cell::RefCell<Vec<u8>>,
        reads_at_flush: &'a std::cell::RefCell<Vec<usize>>,
        log: &'a std::cell::RefCell<Vec<usize>>,
    }

    impl Write for Recorder<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.reads_at_flush.borrow_mut().push(self.log.borrow().len());
            Ok(())
        }
    }

    #[test]
    fn output_flushed_before_blocking_read() {
        let log = std::cell::RefCell::new(Vec::new());
        let written = std::cell::RefCell::new(Vec::new());
        let reads_at_flush = std::cell::RefCell::new(Vec::new());
        let input = Trickle {
            data: b"xy",
            log: &log,
        };
        let output = Recorder {
            written: &written,
            reads_at_flush: &reads_at_flush,
            log: &log,
        };
        let mut wire = Wire::new(input, output, None);
        wire.read_byte().unwrap();
        wire.write(b"2:Kx,").unwrap();
        assert!(written.borrow().is_empty());
        wire.read_byte().unwrap();
        assert_eq!(&*written.borrow(), b"2:Kx,");
        assert_eq!(reads_at_flush.borrow().last(), Some(&1));
    }

    #[test]
    fn expired_deadline() {
        let mut out = Vec::new();
        let past = Instant::now() - Duration::from_secs(1);
        let mut wire = Wire::new(&b"abc"[..], &mut out, Some(past));
        assert!(matches!(wire.read_byte(), Err(Abort::Timeout)));
    }
}
